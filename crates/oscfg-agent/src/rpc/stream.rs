//! Task-notification stream client.
//!
//! Explicit state machine over the endpoint's stream:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> (Draining | Reconnecting) -> Closed
//! ```
//!
//! Any stream error moves to `Reconnecting` with jittered exponential
//! backoff; after a successful reconnect the server is authoritative and
//! may re-issue in-flight task ids, which the executor collapses.
//! Cancellation moves to `Draining`: the in-flight task (if any) finishes
//! before the client reports `Closed`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use oscfg_core::backoff::{Backoff, BackoffConfig};

use crate::executor::TaskExecutor;
use crate::metrics::AgentMetrics;

use super::AgentEndpoint;

/// Client states, exposed for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet started.
    Idle,
    /// Opening the stream.
    Connecting,
    /// Receiving task notifications.
    Streaming,
    /// Cancelled; waiting for in-flight work.
    Draining,
    /// Stream failed; backing off before reopening.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Why [`TaskStreamClient::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// Cancelled and drained.
    Cancelled,
}

/// The reconnecting stream client.
pub struct TaskStreamClient {
    endpoint: Arc<dyn AgentEndpoint>,
    executor: TaskExecutor,
    metrics: Arc<AgentMetrics>,
    backoff_config: BackoffConfig,
}

impl TaskStreamClient {
    /// Client over `endpoint`, dispatching into `executor`.
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn AgentEndpoint>,
        executor: TaskExecutor,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            endpoint,
            executor,
            metrics,
            backoff_config: BackoffConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(120),
                multiplier: 2.0,
            },
        }
    }

    /// Receive and dispatch until cancelled. Reconnects internally on any
    /// stream failure; returns only after in-flight work has drained.
    pub async fn run(&self, cancel: CancellationToken) -> StreamExit {
        let mut state = StreamState::Idle;
        let mut backoff = Backoff::new(self.backoff_config.clone());

        loop {
            match state {
                StreamState::Idle | StreamState::Connecting => {
                    if cancel.is_cancelled() {
                        state = StreamState::Draining;
                        continue;
                    }
                    match self.endpoint.open_task_stream().await {
                        Ok(stream) => {
                            tracing::info!("task notification stream open");
                            backoff.reset();
                            state = self.stream(stream, &cancel).await;
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(error = %e, retry_in = ?delay, "stream connect failed");
                            self.metrics.stream_reconnects.inc();
                            tokio::select! {
                                () = cancel.cancelled() => state = StreamState::Draining,
                                () = tokio::time::sleep(delay) => state = StreamState::Connecting,
                            }
                        }
                    }
                }
                StreamState::Reconnecting => {
                    let delay = backoff.next_delay();
                    self.metrics.stream_reconnects.inc();
                    tokio::select! {
                        () = cancel.cancelled() => state = StreamState::Draining,
                        () = tokio::time::sleep(delay) => state = StreamState::Connecting,
                    }
                }
                StreamState::Draining => {
                    // The in-flight task (if any) runs to completion; its
                    // status reaches the server only if a later stream asks.
                    self.executor.wait_idle().await;
                    state = StreamState::Closed;
                }
                StreamState::Streaming => unreachable!("stream() owns this state"),
                StreamState::Closed => {
                    tracing::info!("task notification stream closed");
                    return StreamExit::Cancelled;
                }
            }
        }
    }

    /// Pump one open stream; returns the next state.
    async fn stream(
        &self,
        mut stream: super::TaskStream,
        cancel: &CancellationToken,
    ) -> StreamState {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return StreamState::Draining,
                start = stream.incoming.recv() => match start {
                    Some(start) => {
                        self.executor
                            .handle(start, stream.replies.clone())
                            .await;
                    }
                    None => {
                        tracing::warn!("task notification stream dropped by server");
                        return StreamState::Reconnecting;
                    }
                },
            }
        }
    }
}
