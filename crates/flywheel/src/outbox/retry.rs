//! Retry policy for failed outbox publishes.

use std::time::Duration;

/// Exponential backoff configuration for publish retries.
///
/// After a failed attempt N (1-based), the next attempt is delayed by
/// `min(base_delay * multiplier^(N-1), max_delay)`. Once `max_attempts`
/// have failed, the entry moves to the dead letter queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the initial one. Default: 5.
    pub max_attempts: u32,

    /// Base delay before the first retry. Default: 60 seconds.
    pub base_delay: Duration,

    /// Growth factor per failed attempt. Default: 2.0.
    pub multiplier: f64,

    /// Cap on the delay. Default: 1 hour.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// The delay scheduled after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let delay = self.base_delay.as_secs_f64() * factor;

        if delay.is_finite() {
            Duration::from_secs_f64(delay).min(self.max_delay)
        } else {
            self.max_delay
        }
    }

    /// Whether another attempt is permitted after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
