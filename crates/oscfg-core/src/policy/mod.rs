//! OS-policy data model.
//!
//! A policy assignment is an ordered list of resource groups; each group
//! carries inventory filters and an ordered list of desired-state
//! resources. For one host, at most one group per assignment is active: the
//! first whose filter matches. Assignments are immutable for the lifetime
//! of one apply.

use serde::{Deserialize, Serialize};

use crate::inventory::OsInventory;
use crate::packages::DesiredState;

/// How an assignment is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Check only; report drift without mutating the host.
    Validation,
    /// Check, then bring drifted resources to desired state.
    Enforcement,
}

/// One policy assignment, immutable during an apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAssignment {
    /// Assignment id, unique per service.
    pub id: String,
    /// Revision of the assignment this payload carries.
    pub revision: String,
    /// Apply mode.
    pub mode: PolicyMode,
    /// Groups in declaration order.
    pub groups: Vec<ResourceGroup>,
}

/// An inventory-filtered bundle of resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Filters; an empty list matches every host.
    #[serde(default)]
    pub filters: Vec<InventoryFilter>,
    /// Resources in declaration order.
    pub resources: Vec<Resource>,
}

impl ResourceGroup {
    /// Whether this group applies to `inventory`.
    #[must_use]
    pub fn matches(&self, inventory: &OsInventory) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(inventory))
    }
}

/// Matches a host by OS identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFilter {
    /// Distro short name; empty matches any.
    #[serde(default)]
    pub os_short_name: String,
    /// Version; empty matches any, `N.` prefixes match major version.
    #[serde(default)]
    pub os_version: String,
}

impl InventoryFilter {
    /// Whether `inventory` satisfies this filter.
    #[must_use]
    pub fn matches(&self, inventory: &OsInventory) -> bool {
        if !self.os_short_name.is_empty() && self.os_short_name != inventory.short_name {
            return false;
        }
        if self.os_version.is_empty() {
            return true;
        }
        inventory.version == self.os_version
            || inventory.version.starts_with(&format!("{}.", self.os_version))
    }
}

/// One desired-state unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Id unique within the assignment.
    pub id: String,
    /// Kind-specific desired state.
    pub spec: ResourceSpec,
}

/// Kind tag plus kind-specific spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    /// A package that must be installed or removed.
    Package(PackageResourceSpec),
    /// A package repository definition file.
    Repository(RepositorySpec),
    /// A file with literal desired contents.
    File(FileResourceSpec),
    /// A check/enforce script pair.
    Exec(ExecResourceSpec),
    /// Any kind this agent version does not know. Kept so one foreign
    /// resource degrades to a per-resource error instead of failing the
    /// whole payload.
    #[serde(other)]
    Unsupported,
}

impl ResourceSpec {
    /// Stable kind tag for dispatch and reporting.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Package(_) => ResourceKind::Package,
            Self::Repository(_) => ResourceKind::Repository,
            Self::File(_) => ResourceKind::File,
            Self::Exec(_) => ResourceKind::Exec,
            Self::Unsupported => ResourceKind::Unsupported,
        }
    }
}

/// Resource kinds the registry dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Package install/remove.
    Package,
    /// Repository definition file.
    Repository,
    /// Literal file contents.
    File,
    /// Script-driven resource.
    Exec,
    /// Unknown to this agent; never registered, always a validate error.
    Unsupported,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Package => write!(f, "package"),
            Self::Repository => write!(f, "repository"),
            Self::File => write!(f, "file"),
            Self::Exec => write!(f, "exec"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Package resource spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResourceSpec {
    /// Package name in the host manager's namespace.
    pub name: String,
    /// Desired state.
    pub desired_state: DesiredState,
}

/// Repository resource spec, one variant per manager family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositorySpec {
    /// Apt one-line source.
    Apt(AptRepositorySpec),
    /// Yum INI stanza.
    Yum(YumRepositorySpec),
    /// Zypper INI stanza.
    Zypper(ZypperRepositorySpec),
    /// GooGet YAML entry.
    Googet(GoogetRepositorySpec),
}

/// Apt archive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AptArchiveType {
    /// Binary packages.
    #[default]
    Deb,
    /// Source packages.
    DebSrc,
}

impl AptArchiveType {
    /// Keyword used in the sources.list line.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Deb => "deb",
            Self::DebSrc => "deb-src",
        }
    }
}

/// Apt repository definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AptRepositorySpec {
    /// Archive type; defaults to `deb`.
    #[serde(default)]
    pub archive_type: AptArchiveType,
    /// Repository URI.
    pub uri: String,
    /// Distribution name.
    pub distribution: String,
    /// Components in declaration order.
    #[serde(default)]
    pub components: Vec<String>,
    /// URL of a GPG key to install into the trust store.
    #[serde(default)]
    pub gpg_key: Option<String>,
}

/// Yum repository definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YumRepositorySpec {
    /// Repository id (the INI section name).
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Base URL.
    pub base_url: String,
    /// GPG key URLs in declaration order.
    #[serde(default)]
    pub gpg_keys: Vec<String>,
}

/// Zypper repository definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZypperRepositorySpec {
    /// Repository id (the INI section name).
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Base URL.
    pub base_url: String,
    /// GPG key URLs in declaration order.
    #[serde(default)]
    pub gpg_keys: Vec<String>,
}

/// GooGet repository definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogetRepositorySpec {
    /// Repository name.
    pub name: String,
    /// Repository URL.
    pub url: String,
}

/// Desired file state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// The file must exist with the given contents.
    Present,
    /// The file must not exist.
    Absent,
}

/// File resource spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResourceSpec {
    /// Absolute target path.
    pub path: String,
    /// Desired state.
    pub state: FileState,
    /// Literal contents; ignored for `Absent`.
    #[serde(default)]
    pub content: String,
}

/// Script interpreters for exec resources and exec-step tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    /// POSIX shell.
    #[default]
    Shell,
    /// PowerShell; unsupported on unix hosts.
    Powershell,
}

/// One script invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStepSpec {
    /// Interpreter to run under.
    #[serde(default)]
    pub interpreter: Interpreter,
    /// Inline script body.
    pub script: String,
}

/// Exec resource spec.
///
/// The check script signals state through its exit code: 100 means in
/// desired state, 101 means not; anything else is an error. The enforce
/// script must exit 100 on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResourceSpec {
    /// State-check script.
    pub check: ExecStepSpec,
    /// Remediation script; required only when enforcement runs.
    #[serde(default)]
    pub enforce: Option<ExecStepSpec>,
}

/// Exit code meaning "in desired state" / "success" for exec scripts.
pub const EXEC_IN_DESIRED_STATE: i32 = 100;
/// Exit code meaning "not in desired state" for exec check scripts.
pub const EXEC_NOT_IN_DESIRED_STATE: i32 = 101;

/// Per-resource compliance outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    /// In desired state.
    Compliant,
    /// Drifted (and not brought back, in validation mode).
    NonCompliant,
    /// Not evaluated (group skipped, prior step failed).
    Unknown,
    /// A step failed for this resource.
    Error,
}

/// Steps a resource goes through during an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStep {
    /// Spec validation and workspace setup.
    Validation,
    /// Side-effect-free desired-state check.
    DesiredStateCheck,
    /// Mutating enforcement.
    DesiredStateEnforcement,
    /// Re-check after enforcement; decides the reported state.
    DesiredStateCheckPostEnforcement,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Which step ran.
    pub step: ConfigStep,
    /// Whether it succeeded.
    pub succeeded: bool,
    /// Error message when it did not.
    #[serde(default)]
    pub error: Option<String>,
}

/// Compliance of one resource after an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCompliance {
    /// Resource id.
    pub resource_id: String,
    /// Final state.
    pub state: ComplianceState,
    /// Human-readable cause when not compliant.
    #[serde(default)]
    pub cause: Option<String>,
    /// Step-by-step record in execution order.
    #[serde(default)]
    pub steps: Vec<StepReport>,
    /// Kind-specific output payload.
    #[serde(default)]
    pub output: Option<String>,
}

impl ResourceCompliance {
    /// Fresh record in `Unknown` state.
    #[must_use]
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            state: ComplianceState::Unknown,
            cause: None,
            steps: Vec::new(),
            output: None,
        }
    }

    /// Record a step outcome.
    pub fn record(&mut self, step: ConfigStep, error: Option<String>) {
        self.steps.push(StepReport {
            step,
            succeeded: error.is_none(),
            error,
        });
    }
}

/// Why a policy produced no resource compliances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDisposition {
    /// A group matched and its resources were processed.
    Applied,
    /// No group filter matched this host.
    NoMatchingGroup,
}

/// Result of applying one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    /// Assignment id.
    pub assignment_id: String,
    /// Assignment revision.
    pub revision: String,
    /// Whether a group matched.
    pub disposition: PolicyDisposition,
    /// Index of the active group, when one matched.
    #[serde(default)]
    pub group_index: Option<usize>,
    /// Per-resource compliance in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceCompliance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(short_name: &str, version: &str) -> OsInventory {
        OsInventory {
            short_name: short_name.to_string(),
            version: version.to_string(),
            architecture: "x86_64".to_string(),
            hostname: "host-1".to_string(),
            kernel_release: "6.1.0".to_string(),
            agent_version: "test".to_string(),
        }
    }

    #[test]
    fn test_filter_short_name_and_version() {
        let filter = InventoryFilter {
            os_short_name: "debian".to_string(),
            os_version: "12".to_string(),
        };
        assert!(filter.matches(&inventory("debian", "12")));
        assert!(filter.matches(&inventory("debian", "12.4")));
        assert!(!filter.matches(&inventory("debian", "11")));
        assert!(!filter.matches(&inventory("ubuntu", "12")));
        // "120" is not major version 12.
        assert!(!filter.matches(&inventory("debian", "120")));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let group = ResourceGroup {
            filters: vec![],
            resources: vec![],
        };
        assert!(group.matches(&inventory("anything", "1")));
    }

    #[test]
    fn test_group_any_filter_matches() {
        let group = ResourceGroup {
            filters: vec![
                InventoryFilter {
                    os_short_name: "rhel".to_string(),
                    os_version: String::new(),
                },
                InventoryFilter {
                    os_short_name: "debian".to_string(),
                    os_version: String::new(),
                },
            ],
            resources: vec![],
        };
        assert!(group.matches(&inventory("debian", "12")));
        assert!(!group.matches(&inventory("sles", "15")));
    }

    #[test]
    fn test_unknown_kind_degrades_per_resource() {
        let resource: Resource = serde_json::from_str(
            r#"{"id": "sa-1", "spec": {"kind": "service_account", "email": "x@y"}}"#,
        )
        .unwrap();
        assert_eq!(resource.spec.kind(), ResourceKind::Unsupported);
    }

    #[test]
    fn test_spec_roundtrip_and_kind() {
        let resource = Resource {
            id: "install-vim".to_string(),
            spec: ResourceSpec::Package(PackageResourceSpec {
                name: "vim".to_string(),
                desired_state: crate::packages::DesiredState::Installed,
            }),
        };
        assert_eq!(resource.spec.kind(), ResourceKind::Package);
        let json = serde_json::to_string(&resource).unwrap();
        let back: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resource);
    }
}
