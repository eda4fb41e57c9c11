//! Exponential backoff with additive jitter for transient upstream failures.

use rand::Rng;
use std::time::Duration;

/// Bounded retry schedule: `min(initial * 2^(n-1) + jitter, max)` after the
/// n-th failure, where jitter is uniform in `[0, initial]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call. At least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Retries immediately. Used by tests and tools that must not sleep.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Deterministic part of the delay after `failures` failed attempts.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay to sleep after `failures` failed attempts, jitter included.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let jitter_ms = self.initial_delay.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        (self.base_delay(failures) + jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// Five attempts, 1 s initial delay, 15 s cap.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(15))
    }
}
