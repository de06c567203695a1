use std::time::Duration;

use serde::Deserialize;

/// Capped exponential backoff with a bounded attempt budget.
///
/// The delay before retry `n` (0-indexed) is `min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub const fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    /// Policy used after an established connection drops.
    pub const fn reconnect() -> Self {
        Self::new(1_000, 30_000, 5)
    }

    /// Policy used while the first connection of a session is being made.
    pub const fn initial_connect() -> Self {
        Self::new(1_000, 5_000, 5)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delays_double_until_capped() {
        let policy = BackoffPolicy::reconnect();
        let delays: Vec<u64> = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
    }

    #[test]
    fn initial_connect_caps_at_five_seconds() {
        let policy = BackoffPolicy::initial_connect();
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(5_000));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = BackoffPolicy::new(u64::MAX / 2, u64::MAX, 5);
        assert_eq!(policy.delay_for_attempt(63), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn budget_allows_exactly_max_attempts() {
        let policy = BackoffPolicy::reconnect();
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }
}
