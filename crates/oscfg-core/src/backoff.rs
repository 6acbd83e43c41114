//! Jittered exponential backoff.
//!
//! Every retry loop in the agent (metadata long-poll, agent registration,
//! stream reconnection) shares this delay series: exponential growth from an
//! initial delay, capped at a maximum, with ±10% jitter so that retries from
//! a fleet of hosts spread out instead of synchronizing.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    /// Raw (unjittered) delay for a 1-based attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_possible_wrap)] // attempt counts stay far below i32::MAX
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi((attempt - 1) as i32);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Stateful delay series over a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a fresh series at attempt zero.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay in the series, with ±10% jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        jitter(self.config.delay_for_attempt(self.attempt))
    }

    /// Restart the series after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts taken since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Apply ±10% jitter to a delay.
#[must_use]
pub fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
