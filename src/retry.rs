//! Retry policy for the polling transport
//!
//! Transient poll failures (429/5xx, connectivity) are retried with exponential
//! cooldown and jitter until a consecutive-failure ceiling is reached, after
//! which the session fails. A server-supplied `Retry-After` header takes
//! precedence over the computed cooldown.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cooldown ceiling and backoff shape for transient poll failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive retryable failures tolerated before giving up
    /// (0 = fail on the first one)
    pub max_retries: u32,
    /// Base cooldown in milliseconds for exponential backoff
    pub base_cooldown_ms: u64,
    /// Cap for the exponential cooldown, milliseconds
    pub max_cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_cooldown_ms: 1000,
            max_cooldown_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Cooldown before retry number `attempt` (0-indexed)
    ///
    /// Exponential: `base * 2^attempt`, capped at `max_cooldown_ms`, with
    /// deterministic ±25% jitter so colocated clients do not retry in
    /// lockstep.
    pub fn cooldown_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_cooldown_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp.min(self.max_cooldown_ms);

        let jitter_range = capped / 4;
        let cooldown = if jitter_range > 0 {
            let offset = (attempt as u64 * 13 + 5) % (jitter_range * 2 + 1);
            capped - jitter_range + offset
        } else {
            capped
        };

        Duration::from_millis(cooldown)
    }

    /// Parse a `Retry-After` header value into a cooldown
    ///
    /// Accepts integer or decimal seconds; anything non-positive, above
    /// 300s, or unparseable is ignored.
    pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
        let value = header_value?.trim();
        if let Ok(seconds) = value.parse::<f64>() {
            if seconds > 0.0 && seconds <= 300.0 {
                return Some(Duration::from_secs_f64(seconds));
            }
        }
        None
    }
}
