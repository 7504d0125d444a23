//! Shared fixtures for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::event::CommittedEvent;
use crate::event_processor::{EventProcessor, EventProcessorKind, ProcessingResult};
use crate::ids::{EventProcessorId, PartitionId, ScopeId, StreamId, StreamPosition};
use crate::store::InMemoryEventStore;

/// One dispatch observed by [`ScriptedProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub sequence: u64,
    pub partition: PartitionId,
    /// `(reason, attempts)` for retries, `None` for first attempts.
    pub retry: Option<(String, u32)>,
}

/// Event processor whose outcome per event is scripted up front.
///
/// Events are identified by their event log sequence number. Unscripted
/// events succeed.
#[derive(Debug, Default)]
pub(crate) struct ScriptedProcessor {
    id: EventProcessorId,
    outcomes: Mutex<HashMap<u64, VecDeque<ProcessingResult>>>,
    dispatches: Mutex<Vec<Dispatch>>,
    cancel_on: Mutex<Option<(u64, watch::Sender<bool>)>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `outcomes` for the next dispatches of event `sequence`.
    pub fn script(&self, sequence: u64, outcomes: impl IntoIterator<Item = ProcessingResult>) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(sequence)
            .or_default()
            .extend(outcomes);
    }

    /// Fail event `sequence` `times` times with a fixed retry timeout.
    pub fn fail(&self, sequence: u64, times: usize, retry_timeout: Duration) {
        self.script(
            sequence,
            (0..times).map(|_| ProcessingResult::retry("handler threw", retry_timeout)),
        );
    }

    /// Signal `shutdown` once event `sequence` has been dispatched.
    pub fn cancel_after(&self, sequence: u64, shutdown: watch::Sender<bool>) {
        *self.cancel_on.lock().unwrap() = Some((sequence, shutdown));
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().unwrap().clone()
    }

    /// Sequence numbers in dispatch order.
    pub fn sequences(&self) -> Vec<u64> {
        self.dispatches().iter().map(|d| d.sequence).collect()
    }

    pub fn dispatch_count(&self, sequence: u64) -> usize {
        self.dispatches()
            .iter()
            .filter(|d| d.sequence == sequence)
            .count()
    }

    fn record(&self, event: &CommittedEvent, partition: &PartitionId, retry: Option<(String, u32)>) -> ProcessingResult {
        self.dispatches.lock().unwrap().push(Dispatch {
            sequence: event.event_log_sequence_number,
            partition: partition.clone(),
            retry,
        });
        if let Some((sequence, shutdown)) = self.cancel_on.lock().unwrap().as_ref()
            && *sequence == event.event_log_sequence_number
        {
            shutdown.send_replace(true);
        }
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(&event.event_log_sequence_number)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProcessingResult::Succeeded)
    }
}

#[async_trait]
impl EventProcessor for ScriptedProcessor {
    fn identifier(&self) -> EventProcessorId {
        self.id
    }

    fn kind(&self) -> EventProcessorKind {
        EventProcessorKind::EventHandler
    }

    async fn process(&self, event: &CommittedEvent, partition: &PartitionId) -> ProcessingResult {
        self.record(event, partition, None)
    }

    async fn process_retry(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        reason: &str,
        attempts: u32,
    ) -> ProcessingResult {
        self.record(event, partition, Some((reason.to_string(), attempts)))
    }
}

/// Append one event per entry of `partitions`, numbering sequences from
/// the current stream length so sequence numbers equal positions.
pub(crate) fn seed(
    store: &InMemoryEventStore,
    scope: ScopeId,
    stream: StreamId,
    partitions: &[&str],
) -> Vec<StreamPosition> {
    partitions
        .iter()
        .map(|partition| {
            let sequence = store.len(scope, stream) as u64;
            store.append(
                scope,
                stream,
                PartitionId::from(*partition),
                CommittedEvent::new(sequence, *partition, "Happened", serde_json::json!({})),
            )
        })
        .collect()
}
