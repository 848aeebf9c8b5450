// src/store/retry.rs

//! Bounded, jittered backoff for optimistic-concurrency retries.

use std::time::Duration;

use rand::Rng;

/// How `RunStore` retries a write that lost a revision race.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Hard ceiling on write attempts for a single mutation.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Randomise each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting between attempts. Mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64).max(0.0);

        let millis = if self.jitter && capped >= 2.0 {
            rand::rng().random_range(capped / 2.0..=capped)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}
