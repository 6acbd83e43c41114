//! Time sources and jitter helpers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

/// Monotonic time source with suspendable sleep.
///
/// The system implementation delegates to tokio; tests substitute a manual
/// clock to drive tickers deterministically.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Uniformly distributed duration in `[lo, hi)`.
///
/// Used for first-run scheduling so that a fleet of hosts rebooting together
/// does not stampede the service.
#[must_use]
pub fn uniform_jitter(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span = (hi - lo).as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..span);
    lo + Duration::from_millis(offset)
}
