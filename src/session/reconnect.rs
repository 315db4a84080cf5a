//! Transport retry policy
//!
//! Exponential backoff shared by the initial connect and by automatic
//! reconnection after the tunnel drops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of transport attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt (ms)
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum delay between attempts (ms)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 1000, // 1 second
            multiplier: 2.0,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = base_delay * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// At least one attempt is always made
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 8000);
    }

    #[test]
    fn test_delay_for() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        // Capped
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_attempts_never_zero() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_partial_deserialize() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts":2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.multiplier, 2.0);
    }
}
