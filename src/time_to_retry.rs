//! Retry scheduling for failed event processing.
//!
//! [`BackoffPolicy`] computes how long to wait before retrying an event
//! after a given number of failed attempts. [`time_to_retry`] inspects a
//! processor state and reports how long until the earliest pending retry.

use std::time::{Duration, SystemTime};

use crate::event_processor::ProcessingResult;
use crate::state::ProcessorState;

/// Exponential backoff with a cap.
///
/// `delay_for(n) = min(base_delay * multiplier^(n - 1), max_delay)`, where
/// `n` is the number of attempts made so far (1 after the first failure).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_processing::BackoffPolicy;
///
/// let policy = BackoffPolicy {
///     base_delay: Duration::from_secs(1),
///     multiplier: 2,
///     max_delay: Duration::from_secs(5),
/// };
/// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for(4), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    ///
    /// Default: 1 second.
    pub base_delay: Duration,

    /// Growth factor applied per additional attempt.
    ///
    /// Default: 2.
    pub multiplier: u32,

    /// Upper bound on any single delay.
    ///
    /// Default: 60 seconds.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempts.max(1) {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(self.multiplier.max(1));
        }
        delay.min(self.max_delay)
    }

    /// Absolute retry time for a failure observed at `now`.
    pub fn retry_time(&self, now: SystemTime, attempts: u32) -> SystemTime {
        self.offset(now, self.delay_for(attempts))
    }

    /// Retry time for a failed `result`.
    ///
    /// Honors the timeout of [`ProcessingResult::Retry`]; any other failure
    /// falls back to the backoff curve.
    pub fn retry_time_after(&self, result: &ProcessingResult, now: SystemTime, attempts: u32) -> SystemTime {
        match result {
            ProcessingResult::Retry { retry_timeout, .. } => self.offset(now, *retry_timeout),
            _ => self.retry_time(now, attempts),
        }
    }

    /// `now + delay`, falling back to `max_delay` when the sum is not
    /// representable.
    fn offset(&self, now: SystemTime, delay: Duration) -> SystemTime {
        now.checked_add(delay)
            .or_else(|| now.checked_add(self.max_delay))
            .unwrap_or(now)
    }
}

/// How long until the earliest pending retry in `state`.
///
/// Returns `None` when nothing is failing, and `Duration::ZERO` when a
/// retry is already due.
pub fn time_to_retry(state: &ProcessorState, now: SystemTime) -> Option<Duration> {
    let earliest = match state {
        ProcessorState::Partitioned(state) => state
            .failing_partitions
            .values()
            .map(|failing| failing.retry_time)
            .min(),
        ProcessorState::Unpartitioned(state) => {
            state.failure.as_ref().map(|failure| failure.retry_time)
        }
    }?;
    Some(earliest.duration_since(now).unwrap_or(Duration::ZERO))
}
