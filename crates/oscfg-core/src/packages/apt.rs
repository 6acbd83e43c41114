//! Apt/dpkg driver.
//!
//! Two failure modes get one self-heal attempt each, mirroring how the
//! manager actually breaks in the field:
//!
//! - stderr asking for `dpkg --configure -a` means an interrupted install
//!   left the database half-configured; run the repair once and retry the
//!   original command once.
//! - apt refusing to downgrade under `-y` is retried once with
//!   `--allow-downgrades`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::inventory::normalize_architecture;

use super::{command_failed, PackageError, PackageFamily, PackageManager, PkgInfo};

const APT_GET: &str = "/usr/bin/apt-get";
const DPKG: &str = "/usr/bin/dpkg";
const DPKG_QUERY: &str = "/usr/bin/dpkg-query";

const DPKG_REPAIR_MARKER: &str = "dpkg --configure -a";
const DOWNGRADE_MARKER: &str =
    "E: Packages were downgraded and -y was used without --allow-downgrades.";

/// dpkg-query format emitting one JSON object per line.
const DPKG_QUERY_FORMAT: &str = concat!(
    r#"{"package":"${Package}","architecture":"${Architecture}","#,
    r#""version":"${Version}","status":"${db:Status-Status}"}"#,
    "\n"
);

#[derive(Debug, Deserialize)]
struct DpkgEntry {
    package: String,
    architecture: String,
    version: String,
    status: String,
}

/// [`PackageManager`] for Debian-derived hosts.
pub struct AptManager {
    runner: Arc<dyn CommandRunner>,
}

impl AptManager {
    /// Manager over `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn apt_get(args: &[&str]) -> CommandSpec {
        CommandSpec::new(APT_GET, args).env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn run_apt_get(&self, spec: CommandSpec) -> Result<CommandOutput, PackageError> {
        let out = self.runner.run(&spec).await?;
        if out.success() {
            return Ok(out);
        }

        // Downgrade refusal: retry once with the flag.
        if out.stderr_lossy().contains(DOWNGRADE_MARKER) {
            tracing::debug!("apt-get refused downgrade, retrying with --allow-downgrades");
            let retry = spec.clone().arg("--allow-downgrades");
            let out = self.runner.run(&retry).await?;
            if out.success() {
                return Ok(out);
            }
            return Err(command_failed(retry.display(), out.code, out.stderr_lossy()));
        }

        Err(command_failed(spec.display(), out.code, out.stderr_lossy()))
    }

    /// Run an apt-get command; on a broken-dpkg error, repair once and retry
    /// the original command once.
    async fn run_apt_get_with_repair(
        &self,
        spec: CommandSpec,
    ) -> Result<CommandOutput, PackageError> {
        match self.run_apt_get(spec.clone()).await {
            Ok(out) => Ok(out),
            Err(PackageError::CommandFailed { stderr, .. })
                if stderr.contains(DPKG_REPAIR_MARKER) =>
            {
                tracing::debug!("apt-get error, attempting dpkg repair");
                // Repair failures are logged and ignored; the retry decides.
                let repair = CommandSpec::new(DPKG, &["--configure", "-a"]);
                if let Err(e) = self.runner.run(&repair).await {
                    tracing::warn!(error = %e, "dpkg repair did not run");
                }
                self.run_apt_get(spec).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PackageManager for AptManager {
    fn family(&self) -> PackageFamily {
        PackageFamily::Apt
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        let spec = CommandSpec::new(DPKG_QUERY, &["-W", "-f", "${db:Status-Status}", name]);
        let out = self.runner.run(&spec).await?;
        // dpkg-query exits non-zero for unknown packages; that is a clean
        // "not installed", not a failure.
        Ok(out.success() && String::from_utf8_lossy(&out.stdout).trim() == "installed")
    }

    async fn installed(&self) -> Result<Vec<PkgInfo>, PackageError> {
        let spec = CommandSpec::new(DPKG_QUERY, &["-W", "-f", DPKG_QUERY_FORMAT]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(command_failed(spec.display(), out.code, out.stderr_lossy()));
        }
        Ok(parse_installed(&out.stdout))
    }

    async fn install(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = Self::apt_get(&["install", "-y"]);
        spec.args.extend(names.iter().cloned());
        self.run_apt_get_with_repair(spec).await.map(|_| ())
    }

    async fn remove(&self, names: &[String]) -> Result<(), PackageError> {
        let mut spec = Self::apt_get(&["remove", "-y"]);
        spec.args.extend(names.iter().cloned());
        self.run_apt_get_with_repair(spec).await.map(|_| ())
    }

    async fn upgradable(&self) -> Result<Vec<PkgInfo>, PackageError> {
        self.run_apt_get_with_repair(Self::apt_get(&["update"]))
            .await?;
        let out = self
            .run_apt_get_with_repair(Self::apt_get(&["--just-print", "-qq", "upgrade"]))
            .await?;
        Ok(parse_apt_updates(&out.stdout))
    }
}

fn parse_installed(data: &[u8]) -> Vec<PkgInfo> {
    // Each line is one JSON object; the whole output is not valid JSON.
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            let entry: DpkgEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, line, "unparseable dpkg entry");
                    return None;
                }
            };
            if entry.status != "installed" {
                return None;
            }
            Some(PkgInfo {
                // dpkg registers mixed-case names lower-cased.
                name: entry.package.to_lowercase(),
                version: entry.version,
                arch: normalize_architecture(&entry.architecture),
            })
        })
        .collect()
}

/// Parse `apt-get --just-print -qq upgrade` output.
///
/// Upgrade lines look like:
/// `Inst google-cloud-sdk [245.0.0-0] (246.0.0-0 origin [all])`
fn parse_apt_updates(data: &[u8]) -> Vec<PkgInfo> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| {
            let mut fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || fields[0] != "Inst" {
                return None;
            }
            fields.remove(0);
            // Drop the current-version bracket; lines without one are new
            // installs, not upgrades.
            if fields[1].starts_with('[') {
                fields.remove(1);
            } else {
                return None;
            }
            if fields.last().is_some_and(|f| f.contains("[]")) {
                fields.pop();
            }
            if !fields[1].starts_with('(') || !fields.last().is_some_and(|f| f.ends_with(')')) {
                return None;
            }
            let version = fields[1].trim_start_matches('(');
            let arch = fields
                .last()
                .map(|f| f.trim_matches(|c| matches!(c, '[' | ']' | ')')))
                .unwrap_or_default();
            Some(PkgInfo {
                name: fields[0].to_string(),
                version: version.to_string(),
                arch: normalize_architecture(arch),
            })
        })
        .collect()
}
