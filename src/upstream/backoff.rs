//! Transport-level retry policy with exponential backoff.
//!
//! The default policy retries once (two attempts total) with a 1 second base
//! delay doubled per attempt, on HTTP 429/5xx and connection failures. Fatal
//! statuses are never retried; the caller continues without the endpoint.

use std::time::Duration;

/// Configuration for transport-level retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries beyond the first attempt. Default: 1.
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,

    /// Multiplier applied per retry. Default: 2.0.
    pub multiplier: f64,

    /// Upper bound on any single delay. Default: 60 seconds.
    pub max_delay: Duration,

    /// Apply full jitter (random value in `[0, delay]`) to spread herds on a
    /// shared rate limit. Default: off, so backoff timing stays predictable.
    pub jitter: bool,

    /// HTTP status codes that trigger retry. Default: `[429, 500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Honor `Retry-After` response headers over the computed delay.
    /// Default: `true`.
    pub respect_retry_after: bool,
}

impl RetryPolicy {
    /// No transport retry. Useful in tests that script exact call counts.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay for retry attempt N (0-indexed), capped and optionally jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            fastrand::f64() * capped
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }
}
