//! In-memory event store for tests and embedders without a persistent log.
//!
//! [`InMemoryEventStore`] keeps every `(scope, stream)` as an append-only
//! vector and notifies a [`StreamEventWatcher`] after each append, so
//! stream processors waiting on the next position wake up immediately.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::FetchError;
use crate::event::{CommittedEvent, StreamEvent};
use crate::fetcher::{EventFetcher, PartitionEventStream};
use crate::ids::{PartitionId, ScopeId, StreamId, StreamPosition};
use crate::watcher::StreamEventWatcher;

type Streams = HashMap<(ScopeId, StreamId), Vec<StreamEvent>>;

/// Append-only, in-process event store.
///
/// `Clone` is cheap: all clones share the same streams and watcher.
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<Streams>>,
    watcher: StreamEventWatcher,
}

impl InMemoryEventStore {
    /// Create an empty store notifying `watcher` on every append.
    pub fn new(watcher: StreamEventWatcher) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            watcher,
        }
    }

    /// Append an event to a stream and wake any waiters.
    ///
    /// # Arguments
    ///
    /// * `scope` - Scope of the stream.
    /// * `stream` - Target stream.
    /// * `partition` - Partition of the event; [`PartitionId::NONE`] for
    ///   unpartitioned streams.
    /// * `event` - The committed event.
    ///
    /// # Returns
    ///
    /// The position assigned to the event.
    pub fn append(
        &self,
        scope: ScopeId,
        stream: StreamId,
        partition: PartitionId,
        event: CommittedEvent,
    ) -> StreamPosition {
        let position = {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            let events = streams.entry((scope, stream)).or_default();
            let position = StreamPosition(events.len() as u64);
            events.push(StreamEvent::new(event, position, stream, partition));
            position
        };
        // Notify outside the lock so woken processors can fetch right away.
        self.watcher.notify_for_event(scope, stream, position);
        position
    }

    /// Number of events in a stream.
    pub fn len(&self, scope: ScopeId, stream: StreamId) -> usize {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(scope, stream))
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, scope: ScopeId, stream: StreamId) -> bool {
        self.len(scope, stream) == 0
    }

    fn partition_events(
        &self,
        scope: ScopeId,
        stream: StreamId,
        partition: &PartitionId,
        from: StreamPosition,
    ) -> Vec<StreamEvent> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(scope, stream))
            .map(|events| {
                events
                    .iter()
                    .skip(from.0 as usize)
                    .filter(|event| &event.partition == partition)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventFetcher for InMemoryEventStore {
    async fn fetch(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        Ok(streams
            .get(&(scope, stream))
            .and_then(|events| events.get(position.0 as usize))
            .cloned())
    }

    fn fetch_in_partition<'a>(
        &'a self,
        scope: ScopeId,
        stream: StreamId,
        partition: &'a PartitionId,
        from: StreamPosition,
    ) -> PartitionEventStream<'a> {
        let events = self.partition_events(scope, stream, partition, from);
        Box::pin(tokio_stream::iter(events.into_iter().map(Ok)))
    }
}
