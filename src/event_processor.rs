//! Business-logic boundary invoked by stream processors for every event.
//!
//! Event handlers, filters, projections and embeddings all plug into the
//! engine through the single [`EventProcessor`] trait. The engine never
//! branches on the variant; [`EventProcessorKind`] exists for logging and
//! status reporting.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::event::CommittedEvent;
use crate::ids::{EventProcessorId, PartitionId};

/// The kind of business logic behind an [`EventProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventProcessorKind {
    EventHandler,
    Filter,
    Projection,
    Embedding,
}

impl fmt::Display for EventProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EventHandler => "event handler",
            Self::Filter => "filter",
            Self::Projection => "projection",
            Self::Embedding => "embedding",
        };
        f.write_str(name)
    }
}

/// Outcome of processing a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The event was processed.
    Succeeded,
    /// Processing failed and should be retried after `retry_timeout`.
    Retry {
        reason: String,
        retry_timeout: Duration,
    },
    /// Processing failed without a suggested retry delay.
    ///
    /// Still retried, on the configured backoff curve.
    Failed { reason: String },
}

impl ProcessingResult {
    pub fn retry(reason: impl Into<String>, retry_timeout: Duration) -> Self {
        Self::Retry {
            reason: reason.into(),
            retry_timeout,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Whether the processor gave no retry hint.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Failure reason, if the result is a failure.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Retry { reason, .. } | Self::Failed { reason } => Some(reason),
        }
    }
}

/// Processes committed events one at a time.
///
/// # Contract
///
/// - Invoked exactly once per dispatch attempt; delivery overall is
///   at-least-once because failed events are retried.
/// - Implementations own their timeout discipline. The engine waits for
///   every call to complete.
/// - Failures are reported through [`ProcessingResult`], never by panicking.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// Identifier of this processor, part of the stream processor id.
    fn identifier(&self) -> EventProcessorId;

    fn kind(&self) -> EventProcessorKind;

    /// Process an event for the first time.
    async fn process(&self, event: &CommittedEvent, partition: &PartitionId) -> ProcessingResult;

    /// Process an event that failed before.
    ///
    /// `reason` is the last failure and `attempts` the number of attempts
    /// made so far. Defaults to [`process`](EventProcessor::process).
    async fn process_retry(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        reason: &str,
        attempts: u32,
    ) -> ProcessingResult {
        let _ = (reason, attempts);
        self.process(event, partition).await
    }
}
