//! Single-worker task queue.
//!
//! The host is a shared resource: package databases, repo directories, and
//! trust stores tolerate exactly one writer. Everything that mutates the
//! host goes through this queue, which runs one task at a time in FIFO
//! order. Serializing here removes whole classes of interference bugs
//! without per-resource locks.
//!
//! Each task body runs inside its own spawned task so a panic is contained:
//! it is logged with the task's label and the worker moves on. `close`
//! refuses new work, lets the queue drain, and returns once the in-flight
//! body has returned.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TaskBody = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type TaskCtor = Box<dyn FnOnce(CancellationToken) -> TaskBody + Send + 'static>;

struct Task {
    label: String,
    ctor: TaskCtor,
}

/// Errors enqueuing work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskerError {
    /// The queue has been closed; no further work is accepted.
    #[error("tasker is closed")]
    Closed,
}

/// The single-worker FIFO queue.
pub struct Tasker {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    depth: Arc<AtomicI64>,
    cancel: CancellationToken,
}

impl Tasker {
    /// Start the worker. Task bodies receive child tokens of `cancel`; the
    /// worker itself never kills a running body, it only stops picking new
    /// work once closed.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let depth = Arc::new(AtomicI64::new(0));

        let worker_depth = Arc::clone(&depth);
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let label = task.label;
                tracing::debug!(task = %label, "task started");

                let body = (task.ctor)(worker_cancel.child_token());
                // Own spawn per body: a panic unwinds into the JoinError
                // instead of taking the worker down.
                match tokio::spawn(body).await {
                    Ok(()) => tracing::debug!(task = %label, "task finished"),
                    Err(e) if e.is_panic() => {
                        tracing::error!(task = %label, "task panicked");
                    }
                    Err(e) => {
                        tracing::error!(task = %label, error = %e, "task aborted");
                    }
                }
                worker_depth.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!("tasker worker drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            depth,
            cancel,
        }
    }

    /// Append a task to the queue. Returns immediately.
    ///
    /// The closure is called on the worker with a cancellation token tied to
    /// process shutdown; the body decides how to honor it.
    ///
    /// # Errors
    ///
    /// [`TaskerError::Closed`] after [`close`](Self::close) has begun.
    pub fn enqueue<F, Fut>(&self, label: impl Into<String>, f: F) -> Result<(), TaskerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Task {
            label: label.into(),
            ctor: Box::new(move |token| Box::pin(f(token))),
        };

        let guard = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(TaskerError::Closed);
        };
        if tx.send(task).is_err() {
            return Err(TaskerError::Closed);
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of tasks enqueued or running.
    #[must_use]
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Close the queue: refuse new work, wait for the backlog to drain and
    /// the in-flight body to return. Idempotent; concurrent callers all
    /// block until the drain completes.
    pub async fn close(&self) {
        // Dropping the sender ends the worker's recv loop after the backlog.
        {
            let mut guard = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take();
        }

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "tasker worker failed");
            }
        }
    }

    /// Token that task bodies derive from.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_and_single_worker() {
        let tasker = Tasker::new(CancellationToken::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(false));

        for i in 0..8 {
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            tasker
                .enqueue(format!("task-{i}"), move |_cancel| async move {
                    // Only one body may be live at any instant.
                    assert!(!running.swap(true, Ordering::SeqCst));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.store(false, Ordering::SeqCst);
                    order.lock().unwrap().push(i);
                })
                .unwrap();
        }

        tasker.close().await;
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(tasker.depth(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let tasker = Tasker::new(CancellationToken::new());
        tasker.close().await;
        let err = tasker.enqueue("late", |_| async {}).unwrap_err();
        assert_eq!(err, TaskerError::Closed);
        // Idempotent.
        tasker.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight() {
        let tasker = Tasker::new(CancellationToken::new());
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        tasker
            .enqueue("slow", move |_| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();

        tasker.close().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let tasker = Tasker::new(CancellationToken::new());
        let ran_after = Arc::new(AtomicUsize::new(0));

        tasker
            .enqueue("boom", |_| async {
                panic!("induced");
            })
            .unwrap();
        let ran = Arc::clone(&ran_after);
        tasker
            .enqueue("survivor", move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tasker.close().await;
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_sees_cancellation() {
        let root = CancellationToken::new();
        let tasker = Tasker::new(root.clone());
        let observed = Arc::new(AtomicBool::new(false));
        let observed_clone = Arc::clone(&observed);
        tasker
            .enqueue("observer", move |token| async move {
                root.cancel();
                token.cancelled().await;
                observed_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();
        tasker.close().await;
        assert!(observed.load(Ordering::SeqCst));
    }
}
