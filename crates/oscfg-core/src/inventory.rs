//! Host OS inventory.
//!
//! A small snapshot of what this host is: OS short name, version,
//! architecture, hostname, kernel. Group filters in OS policies match
//! against it, and the periodic inventory report ships it to the service.

use serde::{Deserialize, Serialize};

/// Inventory snapshot for this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInventory {
    /// Distro short name (`debian`, `ubuntu`, `rhel`, `sles`, `windows`).
    pub short_name: String,
    /// Distro version string, e.g. `12` or `22.04`.
    pub version: String,
    /// Normalized machine architecture.
    pub architecture: String,
    /// Hostname.
    pub hostname: String,
    /// Kernel release string.
    pub kernel_release: String,
    /// Agent version embedded at build time.
    pub agent_version: String,
}

/// Source of the inventory snapshot.
pub trait InventoryProvider: Send + Sync {
    /// Current inventory. Implementations may cache; OS identity does not
    /// change while the agent runs.
    fn inventory(&self) -> OsInventory;
}

/// Map the mixed names package managers and distros report onto one set.
#[must_use]
pub fn normalize_architecture(arch: &str) -> String {
    match arch {
        "amd64" | "x86_64" => "x86_64".to_string(),
        "arm64" | "aarch64" => "aarch64".to_string(),
        "i386" | "i686" | "x86" => "x86_32".to_string(),
        "all" | "noarch" => "all".to_string(),
        other => other.to_string(),
    }
}

/// [`InventoryProvider`] reading `/etc/os-release` and `/proc`.
#[derive(Debug, Clone)]
pub struct SystemInventory {
    agent_version: String,
}

impl SystemInventory {
    /// Provider reporting `agent_version` in its snapshots.
    #[must_use]
    pub fn new(agent_version: impl Into<String>) -> Self {
        Self {
            agent_version: agent_version.into(),
        }
    }

    fn read_trimmed(path: &str) -> String {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

impl InventoryProvider for SystemInventory {
    fn inventory(&self) -> OsInventory {
        let os_release = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
        let (short_name, version) = parse_os_release(&os_release);

        OsInventory {
            short_name,
            version,
            architecture: normalize_architecture(std::env::consts::ARCH),
            hostname: Self::read_trimmed("/proc/sys/kernel/hostname"),
            kernel_release: Self::read_trimmed("/proc/sys/kernel/osrelease"),
            agent_version: self.agent_version.clone(),
        }
    }
}

/// Extract `ID` and `VERSION_ID` from os-release format.
fn parse_os_release(contents: &str) -> (String, String) {
    let mut id = String::new();
    let mut version_id = String::new();
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = value.trim_matches('"').to_string();
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version_id = value.trim_matches('"').to_string();
        }
    }
    (id, version_id)
}
