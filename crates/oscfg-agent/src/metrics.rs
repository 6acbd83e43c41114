//! Agent observability.
//!
//! A prometheus registry with the agent's own gauges and counters, served
//! over a localhost-only HTTP listener when `--profile` is passed. The
//! queue-depth gauge is the observable side of the unbounded Tasker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

/// Default profiling/metrics listen port; the listener binds localhost only.
pub const DEFAULT_PROFILE_PORT: u16 = 6060;

/// The agent's metric set.
pub struct AgentMetrics {
    registry: Registry,
    /// Tasks executed, by type and terminal status.
    pub tasks_executed: IntCounterVec,
    /// Stream connect/reconnect attempts after a failure.
    pub stream_reconnects: IntCounter,
    /// Current Tasker queue depth (queued + running).
    pub tasker_depth: IntGauge,
    /// Resource compliance outcomes across apply runs.
    pub resource_states: IntCounterVec,
}

impl AgentMetrics {
    /// Build and register the metric set.
    ///
    /// # Errors
    ///
    /// Propagates registry registration failures.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_executed = IntCounterVec::new(
            Opts::new("oscfg_agent_tasks_total", "Tasks executed by type and status"),
            &["type", "status"],
        )?;
        registry.register(Box::new(tasks_executed.clone()))?;

        let stream_reconnects = IntCounter::with_opts(Opts::new(
            "oscfg_agent_stream_reconnects_total",
            "Task stream reconnect attempts",
        ))?;
        registry.register(Box::new(stream_reconnects.clone()))?;

        let tasker_depth = IntGauge::with_opts(Opts::new(
            "oscfg_agent_tasker_depth",
            "Tasks queued or running in the serial queue",
        ))?;
        registry.register(Box::new(tasker_depth.clone()))?;

        let resource_states = IntCounterVec::new(
            Opts::new(
                "oscfg_agent_resource_states_total",
                "Resource compliance outcomes",
            ),
            &["state"],
        )?;
        registry.register(Box::new(resource_states.clone()))?;

        Ok(Self {
            registry,
            tasks_executed,
            stream_reconnects,
            tasker_depth,
            resource_states,
        })
    }

    /// Prometheus text exposition of the current values.
    ///
    /// # Errors
    ///
    /// Propagates encoding failures.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Serve `/metrics` (and a hint at `/`) until cancelled.
///
/// # Errors
///
/// Returns bind or serve failures; the caller logs and carries on, the
/// listener is not load-bearing.
pub async fn serve(
    metrics: Arc<AgentMetrics>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let handler = {
        let metrics = Arc::clone(&metrics);
        move || {
            let metrics = Arc::clone(&metrics);
            async move {
                metrics
                    .encode_text()
                    .unwrap_or_else(|e| format!("encoding error: {e}\n"))
            }
        }
    };

    let app = Router::new()
        .route("/metrics", get(handler))
        .route("/", get(|| async { "oscfg-agent debug listener\n\nGET /metrics\n" }));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "debug listener up");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
