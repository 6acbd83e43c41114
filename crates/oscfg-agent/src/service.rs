//! Service loop and periodic supervisor.
//!
//! Ownership at steady state: one task watches for signals (in `main`), one
//! polls the restart marker, one drives the task-notification loop, one
//! refreshes registration daily, and the current task runs the periodic
//! ticks. None of them share mutable state except through the Tasker queue
//! and the immutable config snapshot.
//!
//! Ordering: the task loop's first pass happens-before any periodic work is
//! admitted, so a freshly-started agent opens (or deliberately skips) the
//! notification stream before its first inventory run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use oscfg_core::clock::uniform_jitter;
use oscfg_core::config::AgentSettings;
use oscfg_core::tasker::Tasker;

use crate::cleanup::CleanupStack;
use crate::executor::TaskExecutor;
use crate::metrics::AgentMetrics;
use crate::rpc::client::AgentClient;
use crate::rpc::stream::TaskStreamClient;
use crate::rpc::RegisterAgentRequest;

/// How often the restart marker is polled.
pub const RESTART_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often registration is refreshed while the agent is enabled.
pub const REGISTRATION_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounds for the jittered first inventory run.
pub const FIRST_INVENTORY_MIN: Duration = Duration::from_secs(180);
/// Upper bound for the jittered first inventory run.
pub const FIRST_INVENTORY_MAX: Duration = Duration::from_secs(300);

/// Exit code signalling "restart required" to the service manager.
pub const RESTART_EXIT_CODE: i32 = 2;

/// Default restart marker location.
#[must_use]
pub fn default_restart_marker() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/run/oscfg_agent_restart_required")
    } else {
        std::env::temp_dir().join("oscfg_agent_restart_required")
    }
}

/// Seam for the legacy guest-policies pass.
///
/// The implementation ships separately; each periodic tick runs it
/// independently of inventory reporting, its errors are logged inside, and
/// neither blocks the other.
#[async_trait]
pub trait PolicyRunner: Send + Sync {
    /// Run one guest-policies pass.
    async fn run(&self, cancel: &CancellationToken);
}

/// Placeholder runner used when no legacy implementation is wired in.
pub struct NoopPolicyRunner;

#[async_trait]
impl PolicyRunner for NoopPolicyRunner {
    async fn run(&self, _cancel: &CancellationToken) {
        tracing::debug!("guest policies pass skipped, no legacy runner wired");
    }
}

/// Everything the service loop composes.
#[derive(Clone)]
pub struct ServiceContext {
    /// Config snapshot subscription.
    pub settings: watch::Receiver<AgentSettings>,
    /// Registration/inventory client.
    pub client: AgentClient,
    /// Task executor shared with the stream client.
    pub executor: TaskExecutor,
    /// Reconnecting task stream client.
    pub stream_client: Arc<TaskStreamClient>,
    /// The single-worker queue.
    pub tasker: Arc<Tasker>,
    /// Legacy guest-policies seam.
    pub policy_runner: Arc<dyn PolicyRunner>,
    /// Payload for (re-)registration.
    pub register_request: RegisterAgentRequest,
    /// Restart marker path.
    pub restart_marker: PathBuf,
    /// Deferred cleanups, run before the restart exit.
    pub cleanups: Arc<CleanupStack>,
    /// Metric set.
    pub metrics: Arc<AgentMetrics>,
}

/// Run the full service: restart watcher, task loop, registration refresh,
/// periodic ticks. Returns when `cancel` fires.
pub async fn run_service_loop(ctx: ServiceContext, cancel: CancellationToken) {
    tokio::spawn(restart_watcher(ctx.clone(), cancel.clone()));

    // The task loop signals after its first pass; nothing else is admitted
    // before that.
    let (started_tx, started_rx) = oneshot::channel();
    tokio::spawn(task_loop(ctx.clone(), cancel.clone(), started_tx));
    tokio::select! {
        () = cancel.cancelled() => return,
        _ = started_rx => {}
    }

    tokio::spawn(registration_refresh(ctx.clone(), cancel.clone()));

    periodic_ticks(ctx, cancel).await;
}

/// Close the queue, run deferred cleanups. Factored out of the restart
/// watcher so the sequence is testable without the process exit.
pub async fn shutdown_for_restart(ctx: &ServiceContext) {
    tracing::info!("restart marker present, waiting for tasks to complete");
    ctx.tasker.close().await;
    tracing::info!("all tasks completed, stopping agent");
    ctx.cleanups.run();
}

async fn restart_watcher(ctx: ServiceContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(RESTART_POLL_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if ctx.restart_marker.exists() {
            shutdown_for_restart(&ctx).await;
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}

/// The task loop: registers and opens the stream while the flag is on,
/// closes it (draining in-flight work) when the flag flips off.
async fn task_loop(
    ctx: ServiceContext,
    cancel: CancellationToken,
    started: oneshot::Sender<()>,
) {
    let mut settings = ctx.settings.clone();
    let mut started = Some(started);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let enabled = settings.borrow_and_update().task_notification_enabled;

        if enabled {
            // Blocking registration: the stream is useless without it.
            if ctx
                .client
                .register_agent(&cancel, &ctx.register_request)
                .await
                .is_err()
            {
                return;
            }
            signal_started(&mut started);

            // The stream's token trips on root cancel (child token) or on
            // the flag flipping off.
            let stream_cancel = cancel.child_token();
            let flag_trip = stream_cancel.clone();
            let mut flag_rx = settings.clone();
            let flag_watch = tokio::spawn(async move {
                loop {
                    if flag_rx.changed().await.is_err() {
                        return;
                    }
                    if !flag_rx.borrow_and_update().task_notification_enabled {
                        tracing::info!("task notifications disabled, closing stream");
                        flag_trip.cancel();
                        return;
                    }
                }
            });

            ctx.stream_client.run(stream_cancel.clone()).await;
            stream_cancel.cancel();
            flag_watch.abort();
        } else {
            signal_started(&mut started);
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = settings.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn signal_started(started: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = started.take() {
        let _ = tx.send(());
    }
}

async fn registration_refresh(ctx: ServiceContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(REGISTRATION_REFRESH_INTERVAL);
    // Startup registration is the task loop's job.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot = ctx.settings.borrow().clone();
        if snapshot.task_notification_enabled || snapshot.guest_policies_enabled {
            let _ = ctx
                .client
                .register_agent(&cancel, &ctx.register_request)
                .await;
        }
    }
}

async fn periodic_ticks(ctx: ServiceContext, cancel: CancellationToken) {
    let poll_interval = ctx.settings.borrow().effective_poll_interval();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately once; that is the tick driving the first
    // loop pass.
    ticker.tick().await;

    let first_inventory = tokio::time::sleep(uniform_jitter(
        FIRST_INVENTORY_MIN,
        FIRST_INVENTORY_MAX,
    ));
    tokio::pin!(first_inventory);
    let mut ran_first_inventory = false;

    loop {
        let snapshot = ctx.settings.borrow().clone();

        // Guest policies and inventory are independent: errors in one are
        // logged by it and never block the other.
        if snapshot.guest_policies_enabled {
            ctx.policy_runner.run(&cancel).await;
        }

        if snapshot.os_inventory_enabled {
            if !ran_first_inventory {
                // Wait out the jitter window, unless a tick beats it.
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = &mut first_inventory => {}
                    _ = ticker.tick() => {}
                }
                ran_first_inventory = true;
            }
            let executor = ctx.executor.clone();
            if let Err(e) = ctx.tasker.enqueue("Report OSInventory", move |_cancel| async move {
                executor.report_inventory().await;
            }) {
                tracing::error!(error = %e, "could not enqueue inventory report");
            }
        }

        ctx.metrics.tasker_depth.set(ctx.tasker.depth());

        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
    }
}
