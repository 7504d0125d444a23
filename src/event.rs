//! Committed events and their stream-level envelope.
//!
//! This module provides the data types handed to event processors. No I/O
//! happens here; events are produced by an [`EventFetcher`](crate::EventFetcher).

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{PartitionId, StreamId, StreamPosition};

/// An event that has been durably committed to the event log.
///
/// Immutable once committed: fetching the same position twice always
/// yields the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// Position of the event in the global event log.
    pub event_log_sequence_number: u64,
    /// When the event was committed.
    pub occurred: SystemTime,
    /// Identifier of the source that produced the event (e.g. an aggregate root).
    pub event_source: String,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub content: serde_json::Value,
    /// Whether the event is visible outside its producing bounded context.
    pub is_public: bool,
}

impl CommittedEvent {
    /// Build a private event with a fresh id, committed now.
    ///
    /// # Arguments
    ///
    /// * `event_log_sequence_number` - Position in the global event log.
    /// * `event_source` - The producing event source.
    /// * `event_type` - Event type tag.
    /// * `content` - JSON payload.
    pub fn new(
        event_log_sequence_number: u64,
        event_source: impl Into<String>,
        event_type: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_log_sequence_number,
            occurred: SystemTime::now(),
            event_source: event_source.into(),
            event_type: event_type.into(),
            content,
            is_public: false,
        }
    }
}

/// A committed event as it appears in a particular stream.
///
/// Carries the stream position, the partition the event belongs to, and
/// the stream it was read from. Events in unpartitioned streams use
/// [`PartitionId::NONE`] and `partitioned == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: CommittedEvent,
    pub position: StreamPosition,
    pub partition: PartitionId,
    pub stream_id: StreamId,
    pub partitioned: bool,
}

impl StreamEvent {
    pub fn new(
        event: CommittedEvent,
        position: StreamPosition,
        stream_id: StreamId,
        partition: PartitionId,
    ) -> Self {
        let partitioned = !partition.is_none();
        Self {
            event,
            position,
            partition,
            stream_id,
            partitioned,
        }
    }
}
