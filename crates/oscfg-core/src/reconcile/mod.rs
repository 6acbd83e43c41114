//! OS-policy resource reconciler.
//!
//! Executes one apply over a list of policy assignments. Per assignment:
//! pick the first group whose filter matches the host, then run the
//! validate → check → enforce → report → cleanup passes over its resources.
//!
//! Pass ordering rules:
//!
//! - Validate visits every resource before any enforce runs; a validation
//!   failure turns that one resource to `Error` and the group continues.
//! - Check is side-effect-free.
//! - Enforce runs only in enforcement mode and only for drifted resources;
//!   repositories enforce before packages so package installs can use
//!   freshly-written repo files. Otherwise declaration order holds.
//! - The post-enforce re-check decides the reported state, which is what
//!   makes `enforce; check` land on `Compliant` for an idempotent handler.
//! - Cleanup runs for every resource regardless of outcome.

mod exec_resource;
mod file;
mod package;
mod registry;
mod repository;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::exec::{CommandRunner, ExecError};
use crate::fs_safe::FsError;
use crate::inventory::OsInventory;
use crate::keyring::{KeyFetcher, KeyringError};
use crate::packages::{PackageError, PackageFamily, PackageManager};
use crate::policy::{
    ComplianceState, ConfigStep, PolicyAssignment, PolicyDisposition, PolicyMode, PolicyResult,
    ResourceCompliance, ResourceKind,
};

pub use registry::{HandlerCtor, ResourceRegistry};

/// Errors from individual resource steps.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The spec cannot be handled on this host.
    #[error("{0}")]
    Validation(String),

    /// No handler is registered for the resource's kind.
    #[error("unsupported resource kind {kind}")]
    UnsupportedKind {
        /// The kind tag.
        kind: String,
    },

    /// The computed repo path is occupied by a different managed spec whose
    /// contents hash to the same 10-character prefix.
    #[error("repo path collision at {}, refusing to overwrite", path.display())]
    PathCollision {
        /// Colliding path.
        path: PathBuf,
    },

    /// An exec-resource script exited with a code outside its contract.
    #[error("{script} script exited with unexpected code {code:?}")]
    ExecStepCode {
        /// Which script ran.
        script: &'static str,
        /// Its exit code.
        code: Option<i32>,
    },

    /// Package-manager failure.
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Keyring failure.
    #[error(transparent)]
    Keyring(#[from] KeyringError),

    /// Filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Subprocess failure.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Filesystem layout the handlers write into.
///
/// The system layout uses the real well-known paths; tests rebase
/// everything under a temp root.
#[derive(Debug, Clone, Default)]
pub struct HostPaths {
    root: Option<PathBuf>,
}

impl HostPaths {
    /// The real host layout.
    #[must_use]
    pub const fn system() -> Self {
        Self { root: None }
    }

    /// Layout rebased under `root`.
    #[must_use]
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn rebase(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    /// Managed repo file path for `family` and a checksum prefix.
    #[must_use]
    pub fn repo_file(&self, family: PackageFamily, checksum_prefix: &str) -> PathBuf {
        self.rebase(&family.repo_file_template().replace("%s", checksum_prefix))
    }

    /// Apt trust-store path for a key with `checksum`.
    #[must_use]
    pub fn apt_gpg_file(&self, checksum: &str) -> PathBuf {
        self.rebase(&format!(
            "/etc/apt/trusted.gpg.d/osconfig_added_{checksum}.gpg"
        ))
    }

    /// File-resource target path.
    #[must_use]
    pub fn file_resource(&self, path: &str) -> PathBuf {
        self.rebase(path)
    }
}

/// The capability set handlers run against.
///
/// Everything host-specific is injected here once at startup; handlers
/// never branch on the OS themselves.
pub struct HostCapabilities {
    /// Subprocess runner.
    pub runner: Arc<dyn CommandRunner>,
    /// Detected package manager, when the host has one.
    pub package_manager: Option<Arc<dyn PackageManager>>,
    /// GPG key transport.
    pub key_fetcher: Arc<dyn KeyFetcher>,
    /// Cached host inventory for group selection.
    pub inventory: OsInventory,
    /// Filesystem layout.
    pub paths: HostPaths,
}

/// Uniform capability set every resource kind implements.
///
/// One handler instance serves one resource for the duration of one apply;
/// `validate` populates its private workspace, the later passes consume it.
#[async_trait::async_trait]
pub trait ResourceHandler: Send {
    /// Check the spec against host capabilities and populate the managed
    /// workspace (render contents, compute paths, fetch keys).
    async fn validate(&mut self) -> Result<(), ResourceError>;

    /// Whether the host is in the desired state. Must not mutate the host.
    async fn check(&mut self) -> Result<bool, ResourceError>;

    /// Bring the host to the desired state. Idempotent.
    async fn enforce(&mut self) -> Result<(), ResourceError>;

    /// Attach kind-specific output to the compliance record.
    fn populate_output(&self, _compliance: &mut ResourceCompliance) {}

    /// Release per-apply state. Runs regardless of outcome.
    async fn cleanup(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// The reconciliation engine.
pub struct Reconciler {
    registry: ResourceRegistry,
    caps: Arc<HostCapabilities>,
}

impl Reconciler {
    /// Engine with the built-in resource kinds.
    #[must_use]
    pub fn new(caps: Arc<HostCapabilities>) -> Self {
        Self {
            registry: ResourceRegistry::with_builtin_kinds(),
            caps,
        }
    }

    /// Engine with a caller-assembled registry.
    #[must_use]
    pub fn with_registry(caps: Arc<HostCapabilities>, registry: ResourceRegistry) -> Self {
        Self { registry, caps }
    }

    /// Apply all assignments, in order, collecting per-policy results.
    pub async fn apply(&self, assignments: &[PolicyAssignment]) -> Vec<PolicyResult> {
        let mut results = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            results.push(self.apply_assignment(assignment).await);
        }
        results
    }

    async fn apply_assignment(&self, assignment: &PolicyAssignment) -> PolicyResult {
        // First matching group wins; the rest are skipped.
        let Some(group_index) = assignment
            .groups
            .iter()
            .position(|g| g.matches(&self.caps.inventory))
        else {
            tracing::info!(assignment = %assignment.id, "no matching resource group");
            return PolicyResult {
                assignment_id: assignment.id.clone(),
                revision: assignment.revision.clone(),
                disposition: PolicyDisposition::NoMatchingGroup,
                group_index: None,
                resources: Vec::new(),
            };
        };

        let group = &assignment.groups[group_index];
        tracing::info!(
            assignment = %assignment.id,
            revision = %assignment.revision,
            group = group_index,
            mode = ?assignment.mode,
            "applying policy"
        );

        let mut handlers: Vec<Option<Box<dyn ResourceHandler>>> = Vec::new();
        let mut compliances: Vec<ResourceCompliance> = Vec::new();
        for resource in &group.resources {
            compliances.push(ResourceCompliance::new(&resource.id));
            handlers.push(self.registry.dispatch(resource, &self.caps));
        }

        // Validate pass: every resource, before any enforce anywhere.
        for (idx, resource) in group.resources.iter().enumerate() {
            let compliance = &mut compliances[idx];
            let Some(handler) = handlers[idx].as_mut() else {
                let err = ResourceError::UnsupportedKind {
                    kind: resource.spec.kind().to_string(),
                };
                compliance.record(ConfigStep::Validation, Some(err.to_string()));
                compliance.state = ComplianceState::Error;
                compliance.cause = Some(err.to_string());
                continue;
            };
            match handler.validate().await {
                Ok(()) => compliance.record(ConfigStep::Validation, None),
                Err(e) => {
                    tracing::warn!(resource = %resource.id, error = %e, "validate failed");
                    compliance.record(ConfigStep::Validation, Some(e.to_string()));
                    compliance.state = ComplianceState::Error;
                    compliance.cause = Some(e.to_string());
                }
            }
        }

        // Check pass over successfully-validated resources.
        for (idx, resource) in group.resources.iter().enumerate() {
            if compliances[idx].state == ComplianceState::Error {
                continue;
            }
            let Some(handler) = handlers[idx].as_mut() else {
                continue;
            };
            match handler.check().await {
                Ok(in_desired) => {
                    compliances[idx].record(ConfigStep::DesiredStateCheck, None);
                    compliances[idx].state = if in_desired {
                        ComplianceState::Compliant
                    } else {
                        ComplianceState::NonCompliant
                    };
                }
                Err(e) => {
                    tracing::warn!(resource = %resource.id, error = %e, "check failed");
                    compliances[idx].record(ConfigStep::DesiredStateCheck, Some(e.to_string()));
                    compliances[idx].state = ComplianceState::Error;
                    compliances[idx].cause = Some(e.to_string());
                }
            }
        }

        // Enforce pass, repositories first, declaration order otherwise.
        let needs_enforcement = compliances
            .iter()
            .any(|c| c.state == ComplianceState::NonCompliant);
        if assignment.mode == PolicyMode::Enforcement && needs_enforcement {
            let mut order: Vec<usize> = (0..group.resources.len())
                .filter(|&i| compliances[i].state == ComplianceState::NonCompliant)
                .collect();
            order.sort_by_key(|&i| (group.resources[i].spec.kind() != ResourceKind::Repository, i));

            for idx in order {
                let resource = &group.resources[idx];
                let Some(handler) = handlers[idx].as_mut() else {
                    continue;
                };
                tracing::info!(resource = %resource.id, "enforcing");
                if let Err(e) = handler.enforce().await {
                    tracing::warn!(resource = %resource.id, error = %e, "enforce failed");
                    compliances[idx]
                        .record(ConfigStep::DesiredStateEnforcement, Some(e.to_string()));
                    compliances[idx].state = ComplianceState::Error;
                    compliances[idx].cause = Some(e.to_string());
                    continue;
                }
                compliances[idx].record(ConfigStep::DesiredStateEnforcement, None);

                // The re-check decides what gets reported.
                match handler.check().await {
                    Ok(in_desired) => {
                        compliances[idx]
                            .record(ConfigStep::DesiredStateCheckPostEnforcement, None);
                        compliances[idx].state = if in_desired {
                            ComplianceState::Compliant
                        } else {
                            ComplianceState::NonCompliant
                        };
                    }
                    Err(e) => {
                        compliances[idx].record(
                            ConfigStep::DesiredStateCheckPostEnforcement,
                            Some(e.to_string()),
                        );
                        compliances[idx].state = ComplianceState::Error;
                        compliances[idx].cause = Some(e.to_string());
                    }
                }
            }
        }

        // Outputs, then cleanup for everyone; cleanup errors are logged only.
        for (idx, handler) in handlers.iter_mut().enumerate() {
            let Some(handler) = handler else { continue };
            handler.populate_output(&mut compliances[idx]);
            if let Err(e) = handler.cleanup().await {
                tracing::warn!(
                    resource = %group.resources[idx].id,
                    error = %e,
                    "cleanup failed"
                );
            }
        }

        PolicyResult {
            assignment_id: assignment.id.clone(),
            revision: assignment.revision.clone(),
            disposition: PolicyDisposition::Applied,
            group_index: Some(group_index),
            resources: compliances,
        }
    }
}

/// Shared by handlers: error when the host manager does not match `family`.
pub(crate) fn require_family(
    caps: &HostCapabilities,
    family: PackageFamily,
) -> Result<Arc<dyn PackageManager>, ResourceError> {
    match &caps.package_manager {
        Some(pm) if pm.family() == family => Ok(Arc::clone(pm)),
        _ => Err(ResourceError::Validation(format!(
            "cannot manage {family} resources because {family} does not exist on the system"
        ))),
    }
}

/// Test-only capability assembly helpers shared across handler tests.
#[cfg(test)]
pub(crate) mod testing;


pub use exec_resource::ExecResourceHandler;
pub use file::FileResourceHandler;
pub use package::PackageResourceHandler;
pub use repository::RepositoryHandler;

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field(
                "package_manager",
                &self.package_manager.as_ref().map(|pm| pm.family()),
            )
            .field("inventory", &self.inventory)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}
