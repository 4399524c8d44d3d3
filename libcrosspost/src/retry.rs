//! Retry budget and backoff schedule
//!
//! One policy governs both per-target attempts and whole-job re-dispatch:
//! exponential backoff capped at `max_delay`, plus uniform jitter so that
//! targets failing together do not retry in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::ExecutorConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed per target (and per job), including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    /// A publish call running longer than this is treated as ambiguous
    pub attempt_timeout: Duration,
    /// Claim duration on a `publishing` record, renewed with every write
    pub lease: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            attempt_timeout: config.attempt_timeout(),
            lease: config.lease(),
        }
    }

    /// A policy with no waiting between attempts, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            attempt_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(300),
        }
    }

    /// End of a claim taken or renewed at `now`
    pub fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether another attempt fits in the budget after `attempts_made`
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Exponential component for the wait after attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt
    ///
    /// A platform-provided hint (e.g. `Retry-After`) replaces the computed
    /// backoff but is still capped at `max_delay`; otherwise jitter is added
    /// on top of the exponential delay.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        self.backoff(attempt) + jitter
    }
}
