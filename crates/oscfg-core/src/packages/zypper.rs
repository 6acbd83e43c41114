//! Zypper driver for SUSE-derived hosts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::exec::{CommandRunner, CommandSpec};
use crate::inventory::normalize_architecture;

use super::{command_failed, PackageError, PackageFamily, PackageManager, PkgInfo};

const ZYPPER: &str = "/usr/bin/zypper";
const RPM_QUERY: &str = "/usr/bin/rpmquery";

const RPM_QUERY_FORMAT: &str = "%{NAME} %{VERSION}-%{RELEASE} %{ARCH}\n";

/// [`PackageManager`] for zypper hosts.
pub struct ZypperManager {
    runner: Arc<dyn CommandRunner>,
}

impl ZypperManager {
    /// Manager over `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PackageManager for ZypperManager {
    fn family(&self) -> PackageFamily {
        PackageFamily::Zypper
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        let spec = CommandSpec::new(RPM_QUERY, &["-q", name]);
        let out = self.runner.run(&spec).await?;
        Ok(out.success())
    }

    async fn installed(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(RPM_QUERY, &["-a", "--queryformat", RPM_QUERY_FORMAT]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(parse_rpm_list(&out.stdout))
    }

    async fn install(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = CommandSpec::new(
            ZYPPER,
            &["--non-interactive", "install", "--auto-agree-with-licenses"],
        );
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn remove(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = CommandSpec::new(ZYPPER, &["--non-interactive", "remove"]);
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn upgradable(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(ZYPPER, &["-q", "list-updates"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(parse_list_updates(&out.stdout))
    }
}

fn parse_rpm_list(data: &[u8]) -> Vec<PkgInfo> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return None;
            }
            Some(PkgInfo {
                name: fields[0].to_string(),
                version: fields[1].to_string(),
                arch: normalize_architecture(fields[2]),
            })
        })
        .collect()
}

/// Parse `zypper -q list-updates` table rows:
/// `v | Repository | Name | Current Version | Available Version | Arch`
fn parse_list_updates(data: &[u8]) -> Vec<PkgInfo> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            if !line.starts_with("v ") {
                return None;
            }
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PkgInfo {
                name: fields[2].to_string(),
                version: fields[4].to_string(),
                arch: normalize_architecture(fields[5]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::FakeRunner;
    use super::*;

    #[tokio::test]
    async fn test_install_is_non_interactive() {
        let runner = Arc::new(FakeRunner::new(vec![FakeRunner::ok("")]));
        let zypper = ZypperManager::new(runner.clone());
        zypper.install(&["vim".into()]).await.unwrap();
        assert_eq!(
            runner.call_lines(),
            vec!["/usr/bin/zypper --non-interactive install --auto-agree-with-licenses vim"]
        );
    }

    #[test]
    fn test_parse_list_updates() {
        let data = concat!(
            "S | Repository | Name | Current Version | Available Version | Arch\n",
            "--+------------+------+-----------------+-------------------+------\n",
            "v | Main       | vim  | 9.0.1-1         | 9.0.2-1           | x86_64\n",
        );
        let pkgs = parse_list_updates(data.as_bytes());
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].name, "vim");
        assert_eq!(pkgs[0].version, "9.0.2-1");
    }
}
