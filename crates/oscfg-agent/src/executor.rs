//! Task execution.
//!
//! Receives `TaskStart` messages, funnels the work through the Tasker (one
//! host-mutating task at a time), and finishes every task with exactly one
//! `TaskComplete`. An executed task reports one progress message up front
//! and more on an interval while it runs, so even sub-second work emits
//! one-or-more `TaskProgress` before its completion.
//!
//! A small ring of recently completed task ids answers duplicate
//! `TaskStart` messages after a stream reconnect with the cached completion
//! instead of re-executing; an id currently in flight is ignored outright.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use oscfg_core::exec::{CommandRunner, CommandSpec};
use oscfg_core::inventory::InventoryProvider;
use oscfg_core::packages::PackageManager;
use oscfg_core::policy::{ExecStepSpec, Interpreter};
use oscfg_core::reconcile::Reconciler;
use oscfg_core::tasker::Tasker;

use crate::metrics::AgentMetrics;
use crate::rpc::client::AgentClient;
use crate::rpc::{
    ClientReply, InventoryReport, PatchConfig, TaskComplete, TaskDirective, TaskProgress,
    TaskStart, TaskStatus,
};

/// How many completed tasks are remembered for duplicate collapse.
const COMPLETED_CAPACITY: usize = 32;

/// Interval between progress messages while a task runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded ring of recently completed tasks.
struct CompletedTasks {
    entries: VecDeque<(String, TaskComplete)>,
}

impl CompletedTasks {
    fn get(&self, task_id: &str) -> Option<TaskComplete> {
        self.entries
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, complete)| complete.clone())
    }

    fn insert(&mut self, complete: TaskComplete) {
        if self.entries.len() >= COMPLETED_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((complete.task_id.clone(), complete));
    }
}

struct ExecutorInner {
    tasker: Arc<Tasker>,
    reconciler: Arc<Reconciler>,
    client: AgentClient,
    inventory: Arc<dyn InventoryProvider>,
    package_manager: Option<Arc<dyn PackageManager>>,
    runner: Arc<dyn CommandRunner>,
    metrics: Arc<AgentMetrics>,
    completed: Mutex<CompletedTasks>,
    in_flight: Mutex<HashSet<String>>,
    idle: tokio::sync::Notify,
}

/// The task executor. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    /// Executor over the host capabilities.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasker: Arc<Tasker>,
        reconciler: Arc<Reconciler>,
        client: AgentClient,
        inventory: Arc<dyn InventoryProvider>,
        package_manager: Option<Arc<dyn PackageManager>>,
        runner: Arc<dyn CommandRunner>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                tasker,
                reconciler,
                client,
                inventory,
                package_manager,
                runner,
                metrics,
                completed: Mutex::new(CompletedTasks {
                    entries: VecDeque::new(),
                }),
                in_flight: Mutex::new(HashSet::new()),
                idle: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Handle one `TaskStart`: collapse duplicates, or enqueue the work.
    pub async fn handle(&self, start: TaskStart, replies: mpsc::Sender<ClientReply>) {
        let task_id = start.task_id.clone();

        let cached = lock(&self.inner.completed).get(&task_id);
        if let Some(cached) = cached {
            tracing::info!(task = %task_id, "duplicate task start, answering from cache");
            let _ = replies.send(ClientReply::Complete(cached)).await;
            return;
        }
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if !in_flight.insert(task_id.clone()) {
                tracing::info!(task = %task_id, "task already in flight, ignoring duplicate");
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        let body_replies = replies.clone();
        let enqueued = self.inner.tasker.enqueue(task_id.clone(), move |cancel| {
            run_task(inner, start, body_replies, cancel)
        });

        if let Err(e) = enqueued {
            // The queue only refuses work while shutting down, but the
            // stream may still be up; the notification must not vanish
            // without a terminal report.
            tracing::error!(task = %task_id, error = %e, "could not enqueue task");
            let complete = TaskComplete {
                task_id: task_id.clone(),
                status: TaskStatus::Failed,
                reason: format!("could not enqueue task: {e}"),
                output: None,
                policy_results: Vec::new(),
            };
            let _ = replies.send(ClientReply::Complete(complete.clone())).await;
            self.finish(&task_id, Some(complete));
        }
    }

    /// Report one inventory snapshot through the endpoint. Shared by the
    /// periodic tick and the `ReportInventory` directive.
    pub async fn report_inventory(&self) {
        let report = build_inventory_report(&self.inner).await;
        self.inner.client.report_inventory(&report).await;
    }

    /// Block until no task is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if lock(&self.inner.in_flight).is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, task_id: &str, complete: Option<TaskComplete>) {
        if let Some(complete) = complete {
            lock(&self.inner.completed).insert(complete);
        }
        lock(&self.inner.in_flight).remove(task_id);
        self.inner.idle.notify_waiters();
    }
}

/// Body of one task: progress ticker around the directive, then the
/// completion record, cache update, and in-flight release.
async fn run_task(
    inner: Arc<ExecutorInner>,
    start: TaskStart,
    replies: mpsc::Sender<ClientReply>,
    cancel: CancellationToken,
) {
    let task_id = start.task_id.clone();
    let type_name = start.directive.type_name();
    tracing::info!(task = %task_id, r#type = type_name, "task started");

    // First progress goes out before the work starts: every executed task,
    // however fast, reports one-or-more progress messages ahead of its
    // completion.
    let started = ClientReply::Progress(TaskProgress {
        task_id: task_id.clone(),
        seq: 1,
        detail: "started".to_string(),
    });
    let _ = replies.send(started).await;

    // Progress ticker; stopped (and awaited) before the completion goes out
    // so messages for this task id stay in order.
    let ticker_cancel = CancellationToken::new();
    let ticker = tokio::spawn(progress_ticker(
        task_id.clone(),
        replies.clone(),
        ticker_cancel.clone(),
        1,
    ));

    let complete = run_directive(&inner, &task_id, start.directive, &cancel).await;

    ticker_cancel.cancel();
    let _ = ticker.await;

    inner
        .metrics
        .tasks_executed
        .with_label_values(&[type_name, complete.status.as_label()])
        .inc();
    tracing::info!(task = %task_id, status = ?complete.status, "task finished");

    if replies.send(ClientReply::Complete(complete.clone())).await.is_err() {
        // Stream dropped mid-task: the work still ran to completion; the
        // cached record answers the server's re-issued TaskStart.
        tracing::warn!(task = %task_id, "stream gone, caching completion for re-delivery");
    }

    lock(&inner.completed).insert(complete);
    lock(&inner.in_flight).remove(&task_id);
    inner.idle.notify_waiters();
}

async fn progress_ticker(
    task_id: String,
    replies: mpsc::Sender<ClientReply>,
    cancel: CancellationToken,
    start_seq: u64,
) {
    let mut seq = start_seq;
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick.
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {
                seq += 1;
                let progress = ClientReply::Progress(TaskProgress {
                    task_id: task_id.clone(),
                    seq,
                    detail: "running".to_string(),
                });
                if replies.send(progress).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_directive(
    inner: &Arc<ExecutorInner>,
    task_id: &str,
    directive: TaskDirective,
    cancel: &CancellationToken,
) -> TaskComplete {
    let mut complete = TaskComplete {
        task_id: task_id.to_string(),
        status: TaskStatus::Succeeded,
        reason: String::new(),
        output: None,
        policy_results: Vec::new(),
    };

    match directive {
        TaskDirective::ApplyPolicies { assignments } => {
            let results = inner.reconciler.apply(&assignments).await;
            for result in &results {
                for resource in &result.resources {
                    inner
                        .metrics
                        .resource_states
                        .with_label_values(&[state_label(resource.state)])
                        .inc();
                }
            }
            complete.policy_results = results;
        }
        TaskDirective::ReportInventory => {
            let report = build_inventory_report(inner).await;
            inner.client.report_inventory(&report).await;
        }
        TaskDirective::PatchRun(config) => match run_patch(inner, &config, cancel).await {
            Ok(output) => complete.output = Some(output),
            Err(reason) => {
                complete.status = TaskStatus::Failed;
                complete.reason = reason;
            }
        },
        TaskDirective::ExecStep(step) => match run_exec_step(inner, &step).await {
            Ok(output) => complete.output = Some(output),
            Err(reason) => {
                complete.status = TaskStatus::Failed;
                complete.reason = reason;
            }
        },
        TaskDirective::Unknown => {
            complete.status = TaskStatus::Skipped;
            complete.reason = "unknown type".to_string();
        }
    }

    complete
}

async fn build_inventory_report(inner: &Arc<ExecutorInner>) -> InventoryReport {
    let inventory = inner.inventory.inventory();
    let (installed_packages, available_updates) = match &inner.package_manager {
        Some(manager) => {
            let installed = manager.installed().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "installed package listing failed");
                Vec::new()
            });
            let updates = manager.upgradable().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "update listing failed");
                Vec::new()
            });
            (installed, updates)
        }
        None => (Vec::new(), Vec::new()),
    };
    InventoryReport {
        inventory,
        installed_packages,
        available_updates,
    }
}

async fn run_patch(
    inner: &Arc<ExecutorInner>,
    config: &PatchConfig,
    cancel: &CancellationToken,
) -> Result<String, String> {
    let Some(manager) = &inner.package_manager else {
        return Err("no package manager exists on the system".to_string());
    };

    let updates = manager
        .upgradable()
        .await
        .map_err(|e| format!("listing updates: {e}"))?;
    if updates.is_empty() {
        return Ok("0 packages to update".to_string());
    }

    let names: Vec<String> = updates.iter().map(|p| p.name.clone()).collect();
    if config.dry_run {
        return Ok(format!("would update {} packages: {}", names.len(), names.join(", ")));
    }
    if cancel.is_cancelled() {
        return Err("cancelled before install".to_string());
    }

    manager
        .install(&names)
        .await
        .map_err(|e| format!("installing updates: {e}"))?;
    Ok(format!("updated {} packages", names.len()))
}

async fn run_exec_step(
    inner: &Arc<ExecutorInner>,
    step: &ExecStepSpec,
) -> Result<String, String> {
    let spec = match step.interpreter {
        Interpreter::Shell => CommandSpec::new("/bin/sh", &["-c", step.script.as_str()]),
        Interpreter::Powershell => {
            return Err("powershell interpreter is not supported on this host".to_string())
        }
    };
    let out = inner
        .runner
        .run(&spec)
        .await
        .map_err(|e| format!("exec step: {e}"))?;
    if out.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        Err(format!(
            "exec step exited with code {:?}: {}",
            out.code,
            out.stderr_lossy()
        ))
    }
}

fn state_label(state: oscfg_core::policy::ComplianceState) -> &'static str {
    use oscfg_core::policy::ComplianceState;
    match state {
        ComplianceState::Compliant => "compliant",
        ComplianceState::NonCompliant => "non_compliant",
        ComplianceState::Unknown => "unknown",
        ComplianceState::Error => "error",
    }
}

impl TaskStatus {
    /// Metrics label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}
