//! # Reconnect Backoff
//!
//! Exponential backoff with "full jitter": the delay before retry `n` is drawn
//! uniformly from `[0, min(cap, base * 2^(n-1))]`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff parameters for the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Ceiling of the first retry delay, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    pub cap_ms: u64,
    /// Number of retries allowed after consecutive failures before the
    /// connection gives up and closes.
    pub max_attempts: u32,
    /// Draw each delay uniformly below its ceiling. When disabled the ceiling
    /// itself is used.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay before retry `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Delay to wait before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let upper = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=upper))
    }

    /// Whether another retry is allowed after `consecutive_failures` failures.
    pub fn allows_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures <= self.max_attempts
    }
}
