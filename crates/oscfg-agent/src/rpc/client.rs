//! Registration and inventory calls with their retry policies.
//!
//! Registration is blocking for callers: inner attempts back off with
//! jitter inside a ~10-minute budget; when the budget burns out the outer
//! loop sleeps five minutes and starts over, forever. The only terminal
//! outcome besides success is cancellation.
//!
//! Inventory upload is fire-and-forget: a failure is logged and the next
//! periodic tick retries naturally.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use oscfg_core::backoff::{Backoff, BackoffConfig};

use super::{AgentEndpoint, InventoryReport, RegisterAgentRequest, RpcError};

/// Total in-budget retry window for one registration round.
pub const REGISTRATION_BUDGET: Duration = Duration::from_secs(10 * 60);

/// Pause between registration rounds once the budget is exhausted.
pub const REGISTRATION_RETRY_PAUSE: Duration = Duration::from_secs(5 * 60);

/// Thin client over the endpoint seam.
#[derive(Clone)]
pub struct AgentClient {
    endpoint: Arc<dyn AgentEndpoint>,
}

impl AgentClient {
    /// Client over `endpoint`.
    #[must_use]
    pub fn new(endpoint: Arc<dyn AgentEndpoint>) -> Self {
        Self { endpoint }
    }

    /// The underlying endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<dyn AgentEndpoint> {
        &self.endpoint
    }

    /// Register, retrying forever until success or cancellation.
    ///
    /// # Errors
    ///
    /// [`RpcError::Cancelled`] only.
    pub async fn register_agent(
        &self,
        cancel: &CancellationToken,
        request: &RegisterAgentRequest,
    ) -> Result<(), RpcError> {
        loop {
            match self.register_round(cancel, request).await {
                Ok(()) => return Ok(()),
                Err(RpcError::Cancelled) => return Err(RpcError::Cancelled),
                Err(e) => {
                    tracing::error!(error = %e, pause = ?REGISTRATION_RETRY_PAUSE, "registration budget exhausted");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RpcError::Cancelled),
                        () = tokio::time::sleep(REGISTRATION_RETRY_PAUSE) => {}
                    }
                }
            }
        }
    }

    /// One budgeted round of registration attempts.
    async fn register_round(
        &self,
        cancel: &CancellationToken,
        request: &RegisterAgentRequest,
    ) -> Result<(), RpcError> {
        let started = tokio::time::Instant::now();
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        });

        loop {
            match self.endpoint.register_agent(request).await {
                Ok(()) => {
                    tracing::info!(instance = %request.instance_name, "agent registered");
                    return Ok(());
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if started.elapsed() + delay > REGISTRATION_BUDGET {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, retry_in = ?delay, "registration attempt failed");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RpcError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Upload one inventory report. Failures are logged, not retried here.
    pub async fn report_inventory(&self, report: &InventoryReport) {
        match self.endpoint.report_inventory(report).await {
            Ok(()) => tracing::info!(
                packages = report.installed_packages.len(),
                "inventory reported"
            ),
            Err(e) => tracing::error!(error = %e, "inventory report failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::super::{TaskStream, TaskDirective};
    use super::*;

    struct FlakyEndpoint {
        failures_before_success: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AgentEndpoint for FlakyEndpoint {
        async fn register_agent(&self, _request: &RegisterAgentRequest) -> Result<(), RpcError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(RpcError::Unavailable("boom".to_string()))
            } else {
                Ok(())
            }
        }

        async fn report_inventory(&self, _report: &InventoryReport) -> Result<(), RpcError> {
            Ok(())
        }

        async fn open_task_stream(&self) -> Result<TaskStream, RpcError> {
            Err(RpcError::Unavailable("no stream".to_string()))
        }
    }

    fn request() -> RegisterAgentRequest {
        RegisterAgentRequest {
            instance_id: "1".to_string(),
            instance_name: "vm".to_string(),
            agent_version: "test".to_string(),
            supported_capabilities: vec![TaskDirective::ReportInventory.type_name().to_string()],
            os_short_name: "debian".to_string(),
            os_version: "12".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_retries_within_budget() {
        let endpoint = Arc::new(FlakyEndpoint {
            failures_before_success: 3,
            attempts: AtomicUsize::new(0),
        });
        let client = AgentClient::new(endpoint.clone());
        let cancel = CancellationToken::new();

        client.register_agent(&cancel, &request()).await.unwrap();
        assert_eq!(endpoint.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_survives_budget_exhaustion() {
        // Enough failures to burn one full budget and succeed in round two.
        let endpoint = Arc::new(FlakyEndpoint {
            failures_before_success: 30,
            attempts: AtomicUsize::new(0),
        });
        let client = AgentClient::new(endpoint.clone());
        let cancel = CancellationToken::new();

        client.register_agent(&cancel, &request()).await.unwrap();
        assert!(endpoint.attempts.load(Ordering::SeqCst) > 30);
    }

    #[tokio::test]
    async fn test_register_cancellation_is_terminal() {
        let endpoint = Arc::new(FlakyEndpoint {
            failures_before_success: usize::MAX,
            attempts: AtomicUsize::new(0),
        });
        let client = AgentClient::new(endpoint);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.register_agent(&cancel, &request()).await.unwrap_err();
        assert!(matches!(err, RpcError::Cancelled));
    }
}
