//! Bounded exponential backoff.

use std::time::Duration;

/// Delay before the first automatic retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Automatic retries before the supervisor gives up and goes offline.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry schedule for the reconnection supervisor.
///
/// `delay(n) = base × 2^(n−1)`, capped at `max_delay`, for attempts
/// `1..=max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before retry 1.
    pub base_delay: Duration,
    /// Cap applied to every delay.
    pub max_delay: Duration,
    /// Number of automatic retries allowed.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let calculated = base_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(max_ms))
    }

    /// Whether retry `attempt` may still be scheduled automatically.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }
}
