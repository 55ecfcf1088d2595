use std::time::Duration;

use super::ApiError;

/// Bounded exponential backoff for transient failures.
///
/// Attempt `k` (zero-based) waits `base_delay * 2^k` before the next try, so
/// with the defaults a request is sent at most four times with 1s, 2s and 4s
/// between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// `attempt` is the number of retries already spent.
    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> bool {
        attempt < self.attempts && error.is_retryable()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}
