//! Wire types and the agent-endpoint seam.
//!
//! The concrete transport (the service's gRPC surface) stays behind
//! [`AgentEndpoint`]; the agent's logic sees plain message types and a pair
//! of channels per stream. Reconnection, registration retry budgets, and
//! ordering guarantees live in [`client`] and [`stream`] on top of this
//! seam, so they are testable against an in-memory endpoint.

pub mod client;
pub mod http;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use oscfg_core::inventory::OsInventory;
use oscfg_core::packages::PkgInfo;
use oscfg_core::policy::{ExecStepSpec, PolicyAssignment, PolicyResult};

/// Server-push start of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStart {
    /// Server-chosen task id; retransmits after a reconnect reuse it.
    pub task_id: String,
    /// What to do.
    pub directive: TaskDirective,
}

/// Task payloads by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDirective {
    /// Reconcile the given policy assignments.
    ApplyPolicies {
        /// Assignments in application order.
        assignments: Vec<PolicyAssignment>,
    },
    /// Apply pending package updates.
    PatchRun(PatchConfig),
    /// Upload an inventory report now.
    ReportInventory,
    /// Run a single server-issued script step.
    ExecStep(ExecStepSpec),
    /// Anything this agent version does not know; completed as skipped.
    #[serde(other)]
    Unknown,
}

impl TaskDirective {
    /// Stable name for logs and metrics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::ApplyPolicies { .. } => "apply_policies",
            Self::PatchRun(_) => "patch_run",
            Self::ReportInventory => "report_inventory",
            Self::ExecStep(_) => "exec_step",
            Self::Unknown => "unknown",
        }
    }
}

/// Patch-run options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Report what would change without installing.
    #[serde(default)]
    pub dry_run: bool,
}

/// Terminal task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task ran to completion.
    Succeeded,
    /// The task ran and failed.
    Failed,
    /// The task was not run (unknown type).
    Skipped,
}

/// Liveness signal while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Task this progress belongs to.
    pub task_id: String,
    /// Monotonic per-task sequence number.
    pub seq: u64,
    /// Human-readable phase description.
    #[serde(default)]
    pub detail: String,
}

/// Terminal report for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComplete {
    /// Task this completes.
    pub task_id: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Cause for failed/skipped outcomes.
    #[serde(default)]
    pub reason: String,
    /// Type-specific output, when any.
    #[serde(default)]
    pub output: Option<String>,
    /// Per-policy compliance for apply tasks.
    #[serde(default)]
    pub policy_results: Vec<PolicyResult>,
}

/// Client-to-server message on the task stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientReply {
    /// Periodic liveness while a task runs.
    Progress(TaskProgress),
    /// Terminal report; exactly one per executed task.
    Complete(TaskComplete),
}

/// Registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    /// Numeric instance id.
    pub instance_id: String,
    /// Instance name.
    pub instance_name: String,
    /// Agent version string.
    pub agent_version: String,
    /// Task types this agent supports.
    pub supported_capabilities: Vec<String>,
    /// OS short name.
    pub os_short_name: String,
    /// OS version.
    pub os_version: String,
}

/// Inventory upload payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReport {
    /// Host identity snapshot.
    pub inventory: OsInventory,
    /// Installed packages.
    #[serde(default)]
    pub installed_packages: Vec<PkgInfo>,
    /// Pending updates.
    #[serde(default)]
    pub available_updates: Vec<PkgInfo>,
}

/// An open task-notification stream.
///
/// The server pushes [`TaskStart`] into `incoming`; the agent answers
/// through `replies`. Dropping the handle tears the transport down.
pub struct TaskStream {
    /// Server-push side.
    pub incoming: mpsc::Receiver<TaskStart>,
    /// Client-reply side. All replies for a stream funnel through this one
    /// sender, which is what gives per-task-id message ordering.
    pub replies: mpsc::Sender<ClientReply>,
}

/// Errors from the agent-endpoint transport.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The service could not be reached or answered non-success.
    #[error("agent endpoint unavailable: {0}")]
    Unavailable(String),

    /// The task stream failed mid-flight.
    #[error("task stream error: {0}")]
    Stream(String),

    /// The operation was cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,
}

/// The agent-endpoint seam. The real service binding implements this; tests
/// use an in-memory implementation.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Register this agent instance.
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<(), RpcError>;

    /// Upload one inventory report.
    async fn report_inventory(&self, report: &InventoryReport) -> Result<(), RpcError>;

    /// Open a task-notification stream.
    async fn open_task_stream(&self) -> Result<TaskStream, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_directive_deserializes() {
        let start: TaskStart = serde_json::from_str(
            r#"{"task_id": "t1", "directive": {"type": "quantum_defrag"}}"#,
        )
        .unwrap();
        assert!(matches!(start.directive, TaskDirective::Unknown));
        assert_eq!(start.directive.type_name(), "unknown");
    }

    #[test]
    fn test_apply_policies_roundtrip() {
        let start = TaskStart {
            task_id: "t2".to_string(),
            directive: TaskDirective::ApplyPolicies {
                assignments: vec![],
            },
        };
        let json = serde_json::to_string(&start).unwrap();
        let back: TaskStart = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back.directive,
            TaskDirective::ApplyPolicies { .. }
        ));
    }

    #[test]
    fn test_reply_tagging() {
        let reply = ClientReply::Progress(TaskProgress {
            task_id: "t1".to_string(),
            seq: 4,
            detail: String::new(),
        });
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""type":"progress""#));
    }
}
