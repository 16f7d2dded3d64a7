//! Retry policy for transient network failures.
//!
//! The controller is pure decision logic: given the session's status and how
//! many network errors it has absorbed, it says whether to skip, retry after
//! a delay, or fail terminally. The supervisor owns the actual sleeping and
//! state mutation.

use std::time::Duration;

use audiotome_events::SessionStatus;
use rand::Rng;

use crate::config::RetryConfig;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do nothing; the session is paused or already terminal.
    Skip,
    /// The retry budget is exhausted; fail the session.
    Fail,
    /// Schedule a recovery attempt after `delay`.
    Backoff {
        /// One-based attempt number this retry represents.
        attempt: u32,
        /// Delay before the recovery attempt, jitter included.
        delay: Duration,
    },
}

/// Applies the configured retry ceiling and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    /// Construct a controller for the given policy.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide how to react to a network error on a session.
    ///
    /// `retry_count` is the number of retries already consumed since the
    /// last byte of forward progress.
    #[must_use]
    pub fn decide(&self, status: SessionStatus, retry_count: u32) -> RetryDecision {
        if status != SessionStatus::Downloading {
            return RetryDecision::Skip;
        }
        if retry_count >= self.config.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Backoff {
            attempt: retry_count + 1,
            delay: self.backoff_delay(retry_count),
        }
    }

    /// Backoff delay for the given zero-based attempt: `base * 2^attempt`
    /// plus random jitter up to the configured bound.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(20)));
        let jitter_bound = u64::try_from(self.config.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_bound == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=jitter_bound);
        base.saturating_add(Duration::from_millis(jitter))
    }
}
