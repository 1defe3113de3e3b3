//! Exponential backoff for projection retries.

use std::time::Duration;

/// Retry schedule for failed projection events.
///
/// # Default Values
///
/// - `base_delay`: 1 second
/// - `max_delay`: 5 minutes
/// - `max_retries`: 5
/// - `jitter_ratio`: 0.1 (up to 10% added on top of the delay)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap for the exponential delay.
    pub max_delay: Duration,
    /// Failed attempts allowed before a record becomes permanent.
    pub max_retries: i32,
    /// Fraction of the delay added as random jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_retries: 5,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `retry_count` failures, without
    /// jitter: `min(base * 2^(retry_count - 1), max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.saturating_sub(1)).unwrap_or(0);
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Adds jitter to `delay`. `fraction` is a random value in `[0.0, 1.0)`.
    #[must_use]
    pub fn with_jitter(&self, delay: Duration, fraction: f64) -> Duration {
        let ratio = self.jitter_ratio.max(0.0) * fraction.clamp(0.0, 1.0);
        delay + delay.mul_f64(ratio)
    }

    /// Whether a record with `retry_count` failed attempts has exhausted its
    /// retries.
    #[must_use]
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count > self.max_retries
    }
}
