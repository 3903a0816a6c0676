//! Exponential backoff for delivery retries.
//!
//! Defaults per the delivery contract: base 1s, factor 2, jitter ±25%,
//! cap 5 minutes, 5 attempts total. Retry applies only to the `error`
//! classification; `rejected` is terminal.

use std::time::Duration;

use rand::Rng;

/// Configuration for exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base: Duration,

    /// Multiplier per subsequent attempt.
    pub factor: f64,

    /// Upper bound on any single delay.
    pub cap: Duration,

    /// Symmetric jitter fraction (0.25 = ±25%).
    pub jitter: f64,
}

impl BackoffConfig {
    /// The delivery scheduler's defaults.
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base: Duration::from_secs(1),
        factor: 2.0,
        cap: Duration::from_secs(5 * 60),
        jitter: 0.25,
    };

    /// Deterministic (pre-jitter) delay after failed attempt `attempt`
    /// (1-indexed): `base * factor^(attempt-1)`, capped.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self.base.as_secs_f64() * self.factor.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.cap.as_secs_f64()))
    }

    /// The actual sleep: deterministic delay with ±`jitter` applied.
    pub fn jittered_delay_after_attempt(&self, attempt: u32) -> Duration {
        let delay = self.delay_after_attempt(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let scale = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * scale)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
