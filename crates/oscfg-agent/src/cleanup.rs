//! Deferred-cleanup stack.
//!
//! Exit paths share one LIFO stack of cleanup functions: the singleton-lock
//! release, log flushing, stale-file removal. Normal return, startup fatal,
//! and restart-marker shutdown all run the whole stack, in reverse
//! registration order, exactly once.

use std::sync::Mutex;

type CleanupFn = Box<dyn FnOnce() + Send>;

/// LIFO stack of named cleanup functions.
#[derive(Default)]
pub struct CleanupStack {
    funcs: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupStack {
    /// Empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup; later registrations run first.
    pub fn push(&self, name: impl Into<String>, f: impl FnOnce() + Send + 'static) {
        self.funcs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((name.into(), Box::new(f)));
    }

    /// Run and drain the stack. Idempotent: a second call finds it empty.
    pub fn run(&self) {
        let mut funcs = {
            let mut guard = self
                .funcs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some((name, f)) = funcs.pop() {
            tracing::debug!(cleanup = %name, "running deferred cleanup");
            f();
        }
    }

    /// Number of registered cleanups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
