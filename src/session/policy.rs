//! Reconnect Policy
//!
//! Capped exponential backoff: `delay(n) = min(base * 2^(n-1), max)` for the
//! 1-indexed attempt `n`.

use std::time::Duration;

use crate::config::SessionConfig;

/// Backoff parameters consulted by the connection manager after a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Initial backoff unit in milliseconds
    pub base_delay_ms: u64,
    /// Hard ceiling on the computed delay in milliseconds
    pub max_delay_ms: u64,
    /// Number of retries before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            max_attempts: 5,
        }
    }
}

impl From<&SessionConfig> for ReconnectPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Attempt 0 is never requested by the manager; it is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Whether another retry may be scheduled after `attempt_count` retries
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}
