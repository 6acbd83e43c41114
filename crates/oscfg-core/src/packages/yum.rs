//! Yum driver for RHEL-derived hosts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::exec::{CommandRunner, CommandSpec};
use crate::inventory::normalize_architecture;

use super::{command_failed, PackageError, PackageFamily, PackageManager, PkgInfo};

const YUM: &str = "/usr/bin/yum";
const RPM_QUERY: &str = "/usr/bin/rpmquery";

/// yum exits 100 from `check-update` when updates are available.
const YUM_UPDATES_AVAILABLE: i32 = 100;

const RPM_QUERY_FORMAT: &str = "%{NAME} %{VERSION}-%{RELEASE} %{ARCH}\n";

/// [`PackageManager`] for yum hosts.
pub struct YumManager {
    runner: Arc<dyn CommandRunner>,
}

impl YumManager {
    /// Manager over `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PackageManager for YumManager {
    fn family(&self) -> PackageFamily {
        PackageFamily::Yum
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
        let mut spec = CommandSpec::new(YUM, &["install", "-y"]);
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn remove(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = CommandSpec::new(YUM, &["remove", "-y"]);
        spec.args.extend(names.iter().cloned());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(())
    }

    async fn upgradable(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(YUM, &["check-update", "-q"]);
        let out = self.runner.run(&spec).await?;
        match out.code {
            Some(0) => Ok(Vec::new()),
            Some(YUM_UPDATES_AVAILABLE) => Ok(parse_check_update(&out.stdout)),
            code => Err(command_failed(spec.display(), code, out.stderr_lossy())),
        }
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

/// Parse `yum check-update -q`: `name.arch  version  repo` rows.
fn parse_check_update(data: &[u8]) -> Vec<PkgInfo> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::FakeRunner;
    use super::*;

    #[tokio::test]
    async fn test_upgradable_exit_codes() {
        // Exit 0: nothing to do.
        let runner = Arc::new(FakeRunner::new(vec![FakeRunner::ok("")]));
        let yum = YumManager::new(runner.clone());
        assert!(yum.upgradable().await.unwrap().is_empty());

        // Exit 100: updates listed.
        let mut listing = FakeRunner::ok("kernel.x86_64  5.14.0-362  baseos\n");
        listing.code = Some(100);
        let runner = Arc::new(FakeRunner::new(vec![listing]));
        let yum = YumManager::new(runner.clone());
        let updates = yum.upgradable().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "kernel");
        assert_eq!(updates[0].arch, "x86_64");

        // Any other non-zero is an error.
        let runner = Arc::new(FakeRunner::new(vec![FakeRunner::fail(1, "broken")]));
        let yum = YumManager::new(runner.clone());
        assert!(yum.upgradable().await.is_err());
    }

    #[tokio::test]
    async fn test_install_args() {
        let runner = Arc::new(FakeRunner::new(vec![FakeRunner::ok("")]));
        let yum = YumManager::new(runner.clone());
        yum.install(&["httpd".into(), "vim".into()]).await.unwrap();
        assert_eq!(
            runner.call_lines(),
            vec!["/usr/bin/yum install -y httpd vim"]
        );
    }

    #[test]
    fn test_parse_rpm_list() {
        let pkgs = parse_rpm_list(b"bash 5.1.8-9.el9 x86_64\nfilesystem 3.16-2.el9 noarch\n");
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[1].arch, "all");
    }
}
