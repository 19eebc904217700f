//! Retry and timeout policy for pipeline activities.

use std::time::Duration;

/// Per-activity execution policy: attempts, backoff and the two timeout
/// budgets (whole-attempt and heartbeat silence).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: f64,

    /// Start-to-close budget for a single attempt.
    pub start_to_close: Duration,

    /// Maximum tolerated heartbeat silence before the attempt is failed.
    pub heartbeat_timeout: Duration,
}

impl RetryPolicy {
    /// Calculate the delay before the retry following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
