//! Persisted state of stream processors.
//!
//! Two shapes exist, one per processor variant:
//!
//! - [`StreamProcessorState`] for partitioned processors: a main position
//!   plus a map of partitions that fell behind because processing failed.
//! - [`UnpartitionedStreamProcessorState`] for unpartitioned processors: a
//!   single position that stops advancing while the event at it fails.
//!
//! [`ProcessorState`] wraps both so repositories can persist either.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::{PartitionId, StreamPosition};

/// Failure record for a partition that is behind the main position.
///
/// Created when an event in the partition first fails. `position` stays
/// fixed while the same event keeps failing; `processing_attempts`
/// increments and `retry_time` is recomputed on every attempt. The record
/// is removed once the partition has caught up with the main position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPartitionState {
    /// Next position to retry in this partition.
    pub position: StreamPosition,
    /// Earliest time the partition is eligible for retry.
    pub retry_time: SystemTime,
    /// Description of the last failure.
    pub reason: String,
    /// Number of attempts made to process the event at `position`.
    ///
    /// Zero when catch-up stopped before reaching that event, so it has not
    /// failed yet.
    pub processing_attempts: u32,
    /// When the last attempt failed.
    pub last_failed: SystemTime,
}

impl FailingPartitionState {
    /// Whether the partition may be retried at `now`.
    pub fn is_ready(&self, now: SystemTime) -> bool {
        self.retry_time <= now
    }
}

/// State of a partitioned stream processor.
///
/// `position` never decreases except through an explicit
/// [`set_to_position`](crate::StreamProcessorHandle::set_to_position).
/// Entries in `failing_partitions` sit below `position`, unless the
/// position was moved back past them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProcessorState {
    /// Next position to process on the main path.
    pub position: StreamPosition,
    /// Partitions behind the main position, keyed by partition.
    pub failing_partitions: BTreeMap<PartitionId, FailingPartitionState>,
    /// When an event was last processed successfully.
    pub last_successfully_processed: SystemTime,
}

impl StreamProcessorState {
    /// Fresh state starting at `position` with no failing partitions.
    pub fn new(position: StreamPosition) -> Self {
        Self {
            position,
            failing_partitions: BTreeMap::new(),
            last_successfully_processed: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_failing(&self, partition: &PartitionId) -> bool {
        self.failing_partitions.contains_key(partition)
    }

    /// Whether the event at `position` in `partition` waits behind an
    /// earlier failed event of the same partition.
    pub fn is_behind(&self, partition: &PartitionId, position: StreamPosition) -> bool {
        self.failing_partitions
            .get(partition)
            .is_some_and(|failing| failing.position < position)
    }
}

impl Default for StreamProcessorState {
    fn default() -> Self {
        Self::new(StreamPosition::START)
    }
}

/// Failure of the event at the position of an unpartitioned processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub reason: String,
    pub processing_attempts: u32,
    pub retry_time: SystemTime,
    pub last_failed: SystemTime,
}

/// State of an unpartitioned stream processor.
///
/// While `failure` is set the processor is blocked on the event at
/// `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpartitionedStreamProcessorState {
    pub position: StreamPosition,
    pub failure: Option<ProcessingFailure>,
    pub last_successfully_processed: SystemTime,
}

impl UnpartitionedStreamProcessorState {
    pub fn new(position: StreamPosition) -> Self {
        Self {
            position,
            failure: None,
            last_successfully_processed: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failure.is_some()
    }
}

impl Default for UnpartitionedStreamProcessorState {
    fn default() -> Self {
        Self::new(StreamPosition::START)
    }
}

/// State of either processor variant, as stored by a repository.
///
/// Serialized as `{ "partitioned": { ... } }` or `{ "unpartitioned": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Partitioned(StreamProcessorState),
    Unpartitioned(UnpartitionedStreamProcessorState),
}

impl ProcessorState {
    /// Initial state for a processor of the given variant.
    pub fn initial(partitioned: bool) -> Self {
        if partitioned {
            Self::Partitioned(StreamProcessorState::default())
        } else {
            Self::Unpartitioned(UnpartitionedStreamProcessorState::default())
        }
    }

    /// Next position to process on the main path.
    pub fn position(&self) -> StreamPosition {
        match self {
            Self::Partitioned(state) => state.position,
            Self::Unpartitioned(state) => state.position,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::Partitioned(_))
    }

    pub fn last_successfully_processed(&self) -> SystemTime {
        match self {
            Self::Partitioned(state) => state.last_successfully_processed,
            Self::Unpartitioned(state) => state.last_successfully_processed,
        }
    }

    /// Force the main position.
    ///
    /// Failing partitions are left untouched. An unpartitioned failure
    /// describes the event at the old position and is dropped.
    pub(crate) fn set_position(&mut self, position: StreamPosition) {
        match self {
            Self::Partitioned(state) => state.position = position,
            Self::Unpartitioned(state) => {
                state.position = position;
                state.failure = None;
            }
        }
    }
}

impl From<StreamProcessorState> for ProcessorState {
    fn from(state: StreamProcessorState) -> Self {
        Self::Partitioned(state)
    }
}

impl From<UnpartitionedStreamProcessorState> for ProcessorState {
    fn from(state: UnpartitionedStreamProcessorState) -> Self {
        Self::Unpartitioned(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn failing(position: u64, retry_secs: u64) -> FailingPartitionState {
        FailingPartitionState {
            position: StreamPosition(position),
            retry_time: at(retry_secs),
            reason: "handler threw".to_string(),
            processing_attempts: 1,
            last_failed: at(100),
        }
    }

    #[test]
    fn failing_partition_ready_at_or_after_retry_time() {
        let state = failing(3, 110);
        assert!(!state.is_ready(at(109)));
        assert!(state.is_ready(at(110)));
        assert!(state.is_ready(at(200)));
    }

    #[test]
    fn initial_state_matches_variant() {
        assert!(ProcessorState::initial(true).is_partitioned());
        assert!(!ProcessorState::initial(false).is_partitioned());
        assert_eq!(ProcessorState::initial(true).position(), StreamPosition::START);
    }

    #[test]
    fn set_position_keeps_failing_partitions() {
        let mut inner = StreamProcessorState::new(StreamPosition(7));
        inner
            .failing_partitions
            .insert(PartitionId::from("a"), failing(3, 110));
        let mut state = ProcessorState::from(inner);

        state.set_position(StreamPosition(2));

        assert_eq!(state.position(), StreamPosition(2));
        let ProcessorState::Partitioned(inner) = state else {
            panic!("expected partitioned state");
        };
        assert!(inner.is_failing(&PartitionId::from("a")));
    }

    #[test]
    fn only_events_after_the_failed_one_are_behind() {
        let mut state = StreamProcessorState::new(StreamPosition(2));
        state
            .failing_partitions
            .insert(PartitionId::from("p"), failing(5, 110));
        let p = PartitionId::from("p");
        assert!(!state.is_behind(&p, StreamPosition(1)));
        assert!(!state.is_behind(&p, StreamPosition(5)));
        assert!(state.is_behind(&p, StreamPosition(6)));
        assert!(!state.is_behind(&PartitionId::from("q"), StreamPosition(6)));
    }

    #[test]
    fn partitioned_state_serializes_with_tag_and_partition_keys() {
        let mut inner = StreamProcessorState::new(StreamPosition(7));
        inner
            .failing_partitions
            .insert(PartitionId::from("a"), failing(3, 110));
        let state = ProcessorState::from(inner.clone());

        let json = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(json["partitioned"]["position"], 7);
        assert_eq!(json["partitioned"]["failing_partitions"]["a"]["position"], 3);

        let back: ProcessorState = serde_json::from_value(json).expect("deserialize state");
        assert_eq!(back, ProcessorState::Partitioned(inner));
    }

    #[test]
    fn unpartitioned_failure_marks_failing() {
        let mut state = UnpartitionedStreamProcessorState::new(StreamPosition(4));
        assert!(!state.is_failing());
        state.failure = Some(ProcessingFailure {
            reason: "timeout".to_string(),
            processing_attempts: 2,
            retry_time: at(50),
            last_failed: at(40),
        });
        assert!(state.is_failing());
    }
}
