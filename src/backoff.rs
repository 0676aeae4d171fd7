//! Reconnect policy — exponential backoff with an optional attempt ceiling.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait, then run the full handshake again.
    Retry { wait: Duration },
    /// The attempt ceiling is reached; tear the session down.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    /// Zero or negative means unlimited.
    max_attempts: i64,
}

impl From<ReconnectConfig> for ReconnectPolicy {
    fn from(config: ReconnectConfig) -> Self {
        Self { initial_delay: config.initial_delay, max_delay: config.max_delay, max_attempts: config.max_attempts }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: i64) -> Self {
        Self { initial_delay, max_delay, max_attempts }
    }

    /// `min(initial_delay * 2^attempts, max_delay)`, saturating on overflow.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_attempts <= 0
    }

    /// Decide what to do after a failure with `attempts` prior failures.
    #[must_use]
    pub fn decide(&self, attempts: u32) -> ReconnectDecision {
        if !self.is_unlimited() && i64::from(attempts) >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        ReconnectDecision::Retry { wait: self.delay_for(attempts) }
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
