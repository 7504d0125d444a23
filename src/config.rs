//! Tuning knobs for stream processors.
//!
//! All configuration types have sensible defaults accessible via
//! `Default::default()`. Pass a [`StreamProcessorConfig`] to
//! [`StreamProcessorsBuilder::config`](crate::StreamProcessorsBuilder::config)
//! to customize.

use std::time::Duration;

use crate::time_to_retry::BackoffPolicy;

/// Retry policy for transient store failures (fetching events, persisting state).
///
/// The first retry waits `base_delay`; each subsequent retry doubles the
/// wait, capped at `max_delay`. After `max_attempts` failed attempts the
/// error is surfaced and the stream processor stops.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_processing::RetryConfig;
///
/// let config = RetryConfig {
///     max_attempts: 3,
///     ..RetryConfig::default()
/// };
/// assert_eq!(config.delay_before_retry(1), Duration::from_millis(100));
/// assert_eq!(config.delay_before_retry(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    ///
    /// Default: 5.
    pub max_attempts: u32,

    /// Wait before the first retry.
    ///
    /// Default: 100 milliseconds.
    pub base_delay: Duration,

    /// Maximum wait between retries.
    ///
    /// Default: 5 seconds.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Wait before retry number `retry` (1-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..retry {
            delay = (delay * 2).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration for a single stream processor.
#[derive(Debug, Clone)]
pub struct StreamProcessorConfig {
    /// Backoff curve for event-processing failures.
    pub backoff: BackoffPolicy,

    /// Retry policy for persisting state.
    pub persistence_retry: RetryConfig,

    /// Retry policy for fetching events.
    pub fetch_retry: RetryConfig,

    /// Longest time an idle processor stays suspended before re-checking
    /// failing partitions and the main position.
    ///
    /// Default: 1 second.
    pub idle_wait: Duration,

    /// Maximum number of failing partitions caught up concurrently.
    ///
    /// Default: 4.
    pub max_concurrent_catchups: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            persistence_retry: RetryConfig::default(),
            fetch_retry: RetryConfig::default(),
            idle_wait: Duration::from_secs(1),
            max_concurrent_catchups: 4,
        }
    }
}
