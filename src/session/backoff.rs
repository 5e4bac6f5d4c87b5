//! Reconnect backoff
//!
//! Delay for attempt `n` (0-indexed) is `min(base * 2^n, cap)`, without
//! jitter so schedules are reproducible.

use std::time::Duration;

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether `attempts` failed attempts exhaust the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Reconnect bookkeeping owned by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl ReconnectState {
    pub fn new(policy: &Backoff) -> Self {
        Self {
            attempt: 0,
            next_delay: policy.base,
        }
    }

    /// Back to `{0, base}`; called on every successful connect
    pub fn reset(&mut self, policy: &Backoff) {
        *self = Self::new(policy);
    }

    /// Record a failed attempt and return the delay to wait before retrying,
    /// or `None` once the policy is exhausted
    pub fn record_failure(&mut self, policy: &Backoff) -> Option<Duration> {
        if policy.is_exhausted(self.attempt) {
            return None;
        }
        let delay = policy.delay(self.attempt);
        self.attempt += 1;
        self.next_delay = policy.delay(self.attempt);
        Some(delay)
    }
}
