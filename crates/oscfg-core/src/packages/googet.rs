//! GooGet driver for Windows hosts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::exec::{CommandRunner, CommandSpec};
use crate::inventory::normalize_architecture;

use super::{command_failed, PackageError, PackageFamily, PackageManager, PkgInfo};

const GOOGET: &str = "C:/ProgramData/GooGet/googet.exe";

/// [`PackageManager`] for googet hosts.
pub struct GoogetManager {
    runner: Arc<dyn CommandRunner>,
}

impl GoogetManager {
    /// Manager over `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PackageManager for GoogetManager {
    fn family(&self) -> PackageFamily {
        PackageFamily::Googet
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        let spec = CommandSpec::new(GOOGET, &["installed", name]);
        let out = self.runner.run(&spec).await?;
        Ok(out.success()
            && String::from_utf8_lossy(&out.stdout)
                .lines()
                .any(|l| l.trim().starts_with(name)))
    }

    async fn installed(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(GOOGET, &["installed"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(parse_installed(&out.stdout))
    }

    async fn install(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = CommandSpec::new(GOOGET, &["-noconfirm", "install"]);
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn remove(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = CommandSpec::new(GOOGET, &["-noconfirm", "remove"]);
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn upgradable(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(GOOGET, &["update"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(parse_installed(&out.stdout))
    }
}

/// Parse `googet installed` rows: `  name.arch version`.
fn parse_installed(data: &[u8]) -> Vec<PkgInfo> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return None;
            }
            let (name, arch) = fields[0].rsplit_once('.')?;
            Some(PkgInfo {
                name: name.to_string(),
                version: fields[1].to_string(),
                arch: normalize_architecture(arch),
            })
        })
        .collect()
}
