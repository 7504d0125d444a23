//! Identifier and position value types shared by every stream processor.
//!
//! All identifiers are cheap to clone, hashable, and serializable so they
//! can be used both as map keys and as persistence keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifies a tenant. Each tenant runs its own set of stream processors.
    TenantId
);
uuid_id!(
    /// Identifies a scope, a namespace isolating streams from each other.
    ScopeId
);
uuid_id!(
    /// Identifies a stream within a scope.
    StreamId
);
uuid_id!(
    /// Identifies the business-logic processor consuming a stream.
    EventProcessorId
);

impl ScopeId {
    /// The default scope, used for streams that are not explicitly scoped.
    pub const DEFAULT: ScopeId = ScopeId(Uuid::nil());
}

/// Groups events that must be processed in order relative to each other.
///
/// Typically derived from the event source. Events in different partitions
/// carry no ordering guarantee between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub String);

impl PartitionId {
    /// Marker partition for events in unpartitioned streams.
    pub const NONE: PartitionId = PartitionId(String::new());

    /// Returns `true` for the unpartitioned marker.
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Zero-based position of an event within a stream.
///
/// Positions increase monotonically as events are appended. Overflow is not
/// handled; a stream would need 2^64 events to reach it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamPosition(pub u64);

impl StreamPosition {
    /// The first position of every stream.
    pub const START: StreamPosition = StreamPosition(0);

    /// The position immediately after this one.
    pub fn next(self) -> StreamPosition {
        StreamPosition(self.0 + 1)
    }

    /// The raw sequence number.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The position a stream processor tracks as its processing cursor.
///
/// Identical to [`StreamPosition`]: the next position to process.
pub type ProcessingPosition = StreamPosition;

/// Identifies one logical consumer of one stream in one scope.
///
/// Used as the persistence key for stream processor state and as the
/// registry key (together with the tenant) for running processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamProcessorId {
    pub scope_id: ScopeId,
    pub event_processor_id: EventProcessorId,
    pub source_stream_id: StreamId,
}

impl StreamProcessorId {
    pub fn new(
        scope_id: ScopeId,
        event_processor_id: EventProcessorId,
        source_stream_id: StreamId,
    ) -> Self {
        Self {
            scope_id,
            event_processor_id,
            source_stream_id,
        }
    }
}

impl fmt::Display for StreamProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.scope_id, self.event_processor_id, self.source_stream_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_position_next_increments() {
        assert_eq!(StreamPosition::START.next(), StreamPosition(1));
        assert_eq!(StreamPosition(41).next().value(), 42);
    }

    #[test]
    fn partition_none_is_empty_and_displays_marker() {
        assert!(PartitionId::NONE.is_none());
        assert!(!PartitionId::from("account-1").is_none());
        assert_eq!(PartitionId::NONE.to_string(), "<none>");
        assert_eq!(PartitionId::from("account-1").to_string(), "account-1");
    }

    #[test]
    fn default_scope_is_nil() {
        assert_eq!(ScopeId::DEFAULT.0, Uuid::nil());
    }

    #[test]
    fn stream_processor_id_display_joins_components() {
        let id = StreamProcessorId::new(
            ScopeId::DEFAULT,
            EventProcessorId(Uuid::nil()),
            StreamId(Uuid::nil()),
        );
        let nil = Uuid::nil().to_string();
        assert_eq!(id.to_string(), format!("{nil}/{nil}/{nil}"));
    }

    #[test]
    fn ids_serialize_transparently() {
        let position = serde_json::to_value(StreamPosition(7)).expect("serialize position");
        assert_eq!(position, serde_json::json!(7));

        let partition = serde_json::to_value(PartitionId::from("p")).expect("serialize partition");
        assert_eq!(partition, serde_json::json!("p"));
    }
}
