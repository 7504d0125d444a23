//! Retry path for partitions that fell behind the main position.
//!
//! When an event fails in a partitioned stream, the stream processor
//! records a [`FailingPartitionState`] and keeps processing other
//! partitions on the main path. [`FailingPartitions`] later walks each
//! failing partition from its recorded position up to the main position,
//! re-dispatching the failed event and then every later event of that
//! partition, until the partition has caught up or fails again.
//!
//! Partitions are independent, so [`FailingPartitions::catchup_all`] runs
//! up to [`StreamProcessorConfig::max_concurrent_catchups`] of them at
//! once.
//!
//! [`StreamProcessorConfig::max_concurrent_catchups`]: crate::StreamProcessorConfig::max_concurrent_catchups

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::ProcessorError;
use crate::event_processor::EventProcessor;
use crate::fetcher::{EventFetcher, fetch_partition_backlog};
use crate::ids::{PartitionId, StreamPosition, StreamProcessorId};
use crate::state::{FailingPartitionState, StreamProcessorState};
use crate::stream_processor::log_failure;
use crate::time_to_retry::BackoffPolicy;

/// Result of catching up a single failing partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCatchup {
    /// The updated failure record, or `None` if the partition caught up
    /// with the main position.
    pub failing: Option<FailingPartitionState>,
    /// `false` if the partition was not eligible yet or catch-up was
    /// cancelled before dispatching anything.
    pub should_continue: bool,
    /// Number of events processed successfully.
    pub succeeded: usize,
}

/// Catches up failing partitions of one partitioned stream processor.
///
/// `Clone` is cheap: every collaborator is shared.
#[derive(Clone)]
pub struct FailingPartitions {
    id: StreamProcessorId,
    event_processor: Arc<dyn EventProcessor>,
    fetcher: Arc<dyn EventFetcher>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    fetch_retry: RetryConfig,
    max_concurrent: usize,
}

impl FailingPartitions {
    /// # Arguments
    ///
    /// * `id` - The stream processor whose partitions are caught up.
    /// * `event_processor` - Business logic that (re)processes events.
    /// * `fetcher` - Source of partition events.
    /// * `clock` - Time source for retry eligibility and timestamps.
    /// * `backoff` - Retry delay for failures without a suggested timeout.
    /// * `fetch_retry` - Retry policy for reading partition events.
    /// * `max_concurrent` - Upper bound on partitions caught up at once.
    pub fn new(
        id: StreamProcessorId,
        event_processor: Arc<dyn EventProcessor>,
        fetcher: Arc<dyn EventFetcher>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        fetch_retry: RetryConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            id,
            event_processor,
            fetcher,
            clock,
            backoff,
            fetch_retry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Catch up one failing partition.
    ///
    /// Does nothing if `failing.retry_time` has not been reached. Otherwise
    /// re-dispatches the failed event through
    /// [`EventProcessor::process_retry`] (or [`EventProcessor::process`] if
    /// an earlier pass stopped before it), then dispatches every later event
    /// of the partition below `main_position` through
    /// [`EventProcessor::process`]. Stops at the first failure, recording
    /// it with a recomputed retry time, or when `shutdown` is signalled.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Fetch`] if the partition's events could
    /// not be read after all retries. The failure record is left as it was.
    pub async fn catchup_for(
        &self,
        partition: &PartitionId,
        failing: FailingPartitionState,
        main_position: StreamPosition,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PartitionCatchup, ProcessorError> {
        if !failing.is_ready(self.clock.now()) || *shutdown.borrow() {
            return Ok(PartitionCatchup {
                failing: Some(failing),
                should_continue: false,
                succeeded: 0,
            });
        }

        let backlog = fetch_partition_backlog(
            self.fetcher.as_ref(),
            &self.fetch_retry,
            self.id.scope_id,
            self.id.source_stream_id,
            partition,
            failing.position,
            main_position,
        )
        .await
        .map_err(ProcessorError::Fetch)?;

        let mut current = failing.clone();
        let mut succeeded = 0;
        for event in backlog {
            if *shutdown.borrow() {
                tracing::debug!(%partition, position = %current.position, "catch-up cancelled");
                if succeeded > 0 {
                    // The event at the new position has not been dispatched.
                    current.retry_time = self.clock.now();
                    current.reason.clear();
                    current.processing_attempts = 0;
                }
                return Ok(PartitionCatchup {
                    should_continue: succeeded > 0,
                    failing: Some(current),
                    succeeded,
                });
            }

            let is_retry =
                event.position == failing.position && failing.processing_attempts > 0;
            let result = if is_retry {
                self.event_processor
                    .process_retry(
                        &event.event,
                        partition,
                        &failing.reason,
                        failing.processing_attempts,
                    )
                    .await
            } else {
                self.event_processor.process(&event.event, partition).await
            };

            if result.succeeded() {
                succeeded += 1;
                current.position = event.position.next();
                continue;
            }

            let now = self.clock.now();
            let attempts = if is_retry {
                failing.processing_attempts.saturating_add(1)
            } else {
                1
            };
            let retry_time = self.backoff.retry_time_after(&result, now, attempts);
            let reason = result.reason().unwrap_or_default().to_string();
            log_failure(&result, &event, attempts, "failing partition failed again");
            return Ok(PartitionCatchup {
                failing: Some(FailingPartitionState {
                    position: event.position,
                    retry_time,
                    reason,
                    processing_attempts: attempts,
                    last_failed: now,
                }),
                should_continue: true,
                succeeded,
            });
        }

        tracing::info!(%partition, %main_position, "partition caught up");
        Ok(PartitionCatchup {
            failing: None,
            should_continue: true,
            succeeded,
        })
    }

    /// Catch up every eligible failing partition of `state`.
    ///
    /// Partitions whose retry time has not been reached are left untouched.
    /// Partitions that catch up are removed from the returned state.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProcessorError`] hit by any partition, after the
    /// remaining in-flight partitions have finished.
    pub async fn catchup_all(
        &self,
        state: StreamProcessorState,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<StreamProcessorState, ProcessorError> {
        let now = self.clock.now();
        let mut pending: VecDeque<(PartitionId, FailingPartitionState)> = state
            .failing_partitions
            .iter()
            .filter(|(_, failing)| failing.is_ready(now))
            .map(|(partition, failing)| (partition.clone(), failing.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(state);
        }

        let span = tracing::debug_span!(
            "failing_partitions_catchup",
            stream_processor_id = %self.id,
            eligible = pending.len(),
        );
        let main_position = state.position;
        let mut state = state;
        let mut tasks = JoinSet::new();
        let mut first_error = None;

        loop {
            while first_error.is_none() && tasks.len() < self.max_concurrent {
                let Some((partition, failing)) = pending.pop_front() else {
                    break;
                };
                let this = self.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(
                    async move {
                        let outcome = this
                            .catchup_for(&partition, failing, main_position, &shutdown)
                            .await;
                        (partition, outcome)
                    }
                    .instrument(span.clone()),
                );
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((partition, Ok(outcome))) => {
                    if outcome.succeeded > 0 {
                        state.last_successfully_processed = self.clock.now();
                    }
                    match outcome.failing {
                        Some(failing) => {
                            state.failing_partitions.insert(partition, failing);
                        }
                        None => {
                            state.failing_partitions.remove(&partition);
                        }
                    }
                }
                Ok((partition, Err(e))) => {
                    tracing::error!(%partition, error = %e, "catching up failing partition failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ProcessorError::TaskFailed(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(state),
        }
    }
}

impl std::fmt::Debug for FailingPartitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingPartitions")
            .field("id", &self.id)
            .field("backoff", &self.backoff)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::event_processor::ProcessingResult;
    use crate::ids::{EventProcessorId, ScopeId, StreamId};
    use crate::store::InMemoryEventStore;
    use crate::test_support::{ScriptedProcessor, seed};
    use crate::watcher::StreamEventWatcher;

    struct Fixture {
        clock: ManualClock,
        store: InMemoryEventStore,
        processor: Arc<ScriptedProcessor>,
        catchup: FailingPartitions,
        stream: StreamId,
        shutdown_tx: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = InMemoryEventStore::new(StreamEventWatcher::new());
        let processor = Arc::new(ScriptedProcessor::new());
        let stream = StreamId::new();
        let id = StreamProcessorId::new(ScopeId::DEFAULT, EventProcessorId::new(), stream);
        let catchup = FailingPartitions::new(
            id,
            processor.clone(),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            BackoffPolicy::default(),
            RetryConfig::default(),
            4,
        );
        let (shutdown_tx, shutdown) = watch::channel(false);
        Fixture {
            clock,
            store,
            processor,
            catchup,
            stream,
            shutdown_tx,
            shutdown,
        }
    }

    fn failing_at(position: u64, clock: &ManualClock, retry_in: Duration) -> FailingPartitionState {
        FailingPartitionState {
            position: StreamPosition(position),
            retry_time: clock.now() + retry_in,
            reason: "handler threw".to_string(),
            processing_attempts: 1,
            last_failed: clock.now(),
        }
    }

    // Partition "p" holds positions 3, 5 and 6; main position is 7.
    fn seed_p(f: &Fixture) {
        seed(
            &f.store,
            ScopeId::DEFAULT,
            f.stream,
            &["q", "q", "q", "p", "q", "p", "p"],
        );
    }

    #[tokio::test]
    async fn not_retried_before_retry_time() {
        let f = fixture();
        seed_p(&f);
        let failing = failing_at(3, &f.clock, Duration::from_secs(10));

        let outcome = f
            .catchup
            .catchup_for(&PartitionId::from("p"), failing.clone(), StreamPosition(7), &f.shutdown)
            .await
            .expect("catch-up");

        assert_eq!(outcome.failing, Some(failing));
        assert!(!outcome.should_continue);
        assert!(f.processor.dispatches().is_empty());
    }

    #[tokio::test]
    async fn retries_failed_event_then_processes_rest_of_partition() {
        let f = fixture();
        seed_p(&f);
        let failing = failing_at(3, &f.clock, Duration::from_secs(10));
        f.clock.advance(Duration::from_secs(10));

        let outcome = f
            .catchup
            .catchup_for(&PartitionId::from("p"), failing, StreamPosition(7), &f.shutdown)
            .await
            .expect("catch-up");

        assert_eq!(outcome.failing, None);
        assert!(outcome.should_continue);
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(f.processor.sequences(), vec![3, 5, 6]);

        let dispatches = f.processor.dispatches();
        assert_eq!(dispatches[0].retry, Some(("handler threw".to_string(), 1)));
        assert_eq!(dispatches[1].retry, None);
        assert_eq!(dispatches[2].retry, None);
    }

    #[tokio::test]
    async fn events_at_or_after_main_position_are_left_for_main_path() {
        let f = fixture();
        seed_p(&f);
        let failing = failing_at(3, &f.clock, Duration::ZERO);

        let outcome = f
            .catchup
            .catchup_for(&PartitionId::from("p"), failing, StreamPosition(6), &f.shutdown)
            .await
            .expect("catch-up");

        assert_eq!(outcome.failing, None);
        assert_eq!(f.processor.sequences(), vec![3, 5]);
    }

    #[tokio::test]
    async fn repeated_failures_increment_attempts_with_backoff() {
        let f = fixture();
        seed_p(&f);
        f.processor.script(
            3,
            [
                ProcessingResult::failed("still broken"),
                ProcessingResult::failed("still broken"),
            ],
        );
        let partition = PartitionId::from("p");
        let mut failing = failing_at(3, &f.clock, Duration::ZERO);

        for expected_attempts in [2, 3] {
            f.clock.set(failing.retry_time);
            let outcome = f
                .catchup
                .catchup_for(&partition, failing.clone(), StreamPosition(7), &f.shutdown)
                .await
                .expect("catch-up");
            failing = outcome.failing.expect("still failing");

            assert_eq!(failing.position, StreamPosition(3));
            assert_eq!(failing.processing_attempts, expected_attempts);
            assert_eq!(failing.reason, "still broken");
            assert_eq!(failing.last_failed, f.clock.now());
            assert_eq!(
                failing.retry_time,
                f.clock.now() + BackoffPolicy::default().delay_for(expected_attempts)
            );
        }
        assert_eq!(f.processor.dispatch_count(5), 0);
    }

    #[tokio::test]
    async fn failure_later_in_partition_moves_record_and_resets_attempts() {
        let f = fixture();
        seed_p(&f);
        f.processor
            .script(5, [ProcessingResult::retry("downstream busy", Duration::from_secs(30))]);
        let mut failing = failing_at(3, &f.clock, Duration::ZERO);
        failing.processing_attempts = 4;

        let outcome = f
            .catchup
            .catchup_for(&PartitionId::from("p"), failing, StreamPosition(7), &f.shutdown)
            .await
            .expect("catch-up");

        let failing = outcome.failing.expect("failed at 5");
        assert_eq!(failing.position, StreamPosition(5));
        assert_eq!(failing.processing_attempts, 1);
        assert_eq!(failing.reason, "downstream busy");
        assert_eq!(failing.retry_time, f.clock.now() + Duration::from_secs(30));
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(f.processor.dispatch_count(6), 0);
    }

    #[tokio::test]
    async fn cancelled_catchup_dispatches_nothing() {
        let f = fixture();
        seed_p(&f);
        f.shutdown_tx.send(true).expect("receiver alive");
        let failing = failing_at(3, &f.clock, Duration::ZERO);

        let outcome = f
            .catchup
            .catchup_for(&PartitionId::from("p"), failing.clone(), StreamPosition(7), &f.shutdown)
            .await
            .expect("catch-up");

        assert_eq!(outcome.failing, Some(failing));
        assert!(!outcome.should_continue);
        assert!(f.processor.dispatches().is_empty());
    }

    #[tokio::test]
    async fn catchup_cancelled_mid_backlog_resumes_with_first_dispatch() {
        let f = fixture();
        seed_p(&f);
        let (cancel_tx, cancel) = watch::channel(false);
        f.processor.cancel_after(5, cancel_tx);
        let partition = PartitionId::from("p");
        let failing = failing_at(3, &f.clock, Duration::ZERO);

        let outcome = f
            .catchup
            .catchup_for(&partition, failing, StreamPosition(7), &cancel)
            .await
            .expect("catch-up");

        assert!(outcome.should_continue);
        assert_eq!(outcome.succeeded, 2);
        let pending = outcome.failing.expect("6 not dispatched yet");
        assert_eq!(pending.position, StreamPosition(6));
        assert_eq!(pending.processing_attempts, 0);
        assert!(pending.reason.is_empty());
        assert!(pending.is_ready(f.clock.now()));

        let outcome = f
            .catchup
            .catchup_for(&partition, pending, StreamPosition(7), &f.shutdown)
            .await
            .expect("catch-up");

        assert_eq!(outcome.failing, None);
        assert_eq!(f.processor.sequences(), vec![3, 5, 6]);
        assert_eq!(f.processor.dispatches()[2].retry, None);
    }

    #[tokio::test]
    async fn catchup_all_updates_only_eligible_partitions() {
        let f = fixture();
        // "a": 0, 2   "b": 1, 3   main position 4
        seed(&f.store, ScopeId::DEFAULT, f.stream, &["a", "b", "a", "b"]);
        let mut state = StreamProcessorState::new(StreamPosition(4));
        state
            .failing_partitions
            .insert(PartitionId::from("a"), failing_at(0, &f.clock, Duration::ZERO));
        let not_yet = failing_at(1, &f.clock, Duration::from_secs(60));
        state
            .failing_partitions
            .insert(PartitionId::from("b"), not_yet.clone());

        let next = f
            .catchup
            .catchup_all(state.clone(), &f.shutdown)
            .await
            .expect("catch-up");

        assert!(!next.is_failing(&PartitionId::from("a")));
        assert_eq!(next.failing_partitions.get(&PartitionId::from("b")), Some(&not_yet));
        assert_eq!(next.position, StreamPosition(4));
        assert_eq!(next.last_successfully_processed, f.clock.now());
        assert_eq!(f.processor.sequences(), vec![0, 2]);
    }

    #[tokio::test]
    async fn catchup_all_is_idempotent_without_new_events() {
        let f = fixture();
        seed_p(&f);
        f.processor.script(3, [ProcessingResult::failed("broken")]);
        let mut state = StreamProcessorState::new(StreamPosition(7));
        state
            .failing_partitions
            .insert(PartitionId::from("p"), failing_at(3, &f.clock, Duration::ZERO));

        let once = f
            .catchup
            .catchup_all(state, &f.shutdown)
            .await
            .expect("first catch-up");
        let twice = f
            .catchup
            .catchup_all(once.clone(), &f.shutdown)
            .await
            .expect("second catch-up");

        assert_eq!(once, twice);
        assert_eq!(f.processor.dispatch_count(3), 1);
    }

    #[tokio::test]
    async fn catchup_all_without_failing_partitions_is_a_no_op() {
        let f = fixture();
        let state = StreamProcessorState::new(StreamPosition(12));
        let next = f
            .catchup
            .catchup_all(state.clone(), &f.shutdown)
            .await
            .expect("catch-up");
        assert_eq!(next, state);
    }
}
