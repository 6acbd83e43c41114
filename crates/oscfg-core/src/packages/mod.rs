//! Package-manager capabilities.
//!
//! The reconciler depends on the [`PackageManager`] trait, never on OS
//! branches. Detection happens once at startup and picks the capability set
//! for the host's family; each implementation drives its manager binary
//! through [`crate::exec::CommandRunner`] with a non-interactive
//! environment.

mod apt;
mod googet;
mod yum;
mod zypper;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::{CommandRunner, ExecError};

pub use apt::AptManager;
pub use googet::GoogetManager;
pub use yum::YumManager;
pub use zypper::ZypperManager;

/// Desired package state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// The package must be present.
    Installed,
    /// The package must be absent.
    Removed,
}

/// A package the manager knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgInfo {
    /// Package name.
    pub name: String,
    /// Version string in the manager's native format.
    pub version: String,
    /// Normalized architecture.
    pub arch: String,
}

/// Package-manager families the agent can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFamily {
    /// Debian-derived hosts (apt-get/dpkg).
    Apt,
    /// RHEL-derived hosts.
    Yum,
    /// SUSE-derived hosts.
    Zypper,
    /// Windows hosts using googet.
    Googet,
}

impl PackageFamily {
    /// Template for managed repo file paths; `%s` is replaced with the
    /// first 10 hex characters of the rendered contents' SHA-256.
    #[must_use]
    pub const fn repo_file_template(self) -> &'static str {
        match self {
            Self::Apt => "/etc/apt/sources.list.d/osconfig_added_%s.list",
            Self::Yum => "/etc/yum.repos.d/osconfig_added_%s.repo",
            Self::Zypper => "/etc/zypp/repos.d/osconfig_added_%s.repo",
            Self::Googet => "C:/ProgramData/GooGet/repos/osconfig_added_%s.repo",
        }
    }

    /// Probe the host for a usable manager binary, in preference order.
    #[must_use]
    pub fn detect() -> Option<Self> {
        const PROBES: &[(PackageFamily, &str)] = &[
            (PackageFamily::Apt, "/usr/bin/apt-get"),
            (PackageFamily::Yum, "/usr/bin/yum"),
            (PackageFamily::Zypper, "/usr/bin/zypper"),
            (PackageFamily::Googet, "C:/ProgramData/GooGet/googet.exe"),
        ];
        PROBES
            .iter()
            .find(|(_, path)| Path::new(path).exists())
            .map(|(family, _)| *family)
    }
}

impl std::fmt::Display for PackageFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apt => write!(f, "apt"),
            Self::Yum => write!(f, "yum"),
            Self::Zypper => write!(f, "zypper"),
            Self::Googet => write!(f, "googet"),
        }
    }
}

/// Errors from package-manager operations.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The manager binary returned a failure exit code.
    #[error("{command} failed with code {code:?}: {stderr}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Trimmed stderr.
        stderr: String,
    },

    /// The manager's output did not parse.
    #[error("could not parse {manager} output: {detail}")]
    Parse {
        /// Manager name.
        manager: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// The subprocess could not be run at all.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Capability set every package manager implements.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Which family this manager drives.
    fn family(&self) -> PackageFamily;

    /// Whether `name` is currently installed.
    async fn is_installed(&self, name: &str) -> Result<bool, PackageError>;

    /// All installed packages.
    async fn installed(&self) -> Result<Vec<PkgInfo>, PackageError>;

    /// Install packages by name.
    async fn install(&self, names: &[String]) -> Result<(), PackageError>;

    /// Remove packages by name.
    async fn remove(&self, names: &[String]) -> Result<(), PackageError>;

    /// Packages an upgrade run would change.
    async fn upgradable(&self) -> Result<Vec<PkgInfo>, PackageError>;
}

/// Build the manager for `family` over `runner`.
#[must_use]
pub fn manager_for(
    family: PackageFamily,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn PackageManager> {
    match family {
        PackageFamily::Apt => Arc::new(AptManager::new(runner)),
        PackageFamily::Yum => Arc::new(YumManager::new(runner)),
        PackageFamily::Zypper => Arc::new(ZypperManager::new(runner)),
        PackageFamily::Googet => Arc::new(GoogetManager::new(runner)),
    }
}

pub(crate) fn command_failed(
    command: String,
    code: Option<i32>,
    stderr: String,
) -> PackageError {
    PackageError::CommandFailed {
        command,
        code,
        stderr,
    }
}
