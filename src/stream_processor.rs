//! The per-stream processing loop.
//!
//! A [`ScopedStreamProcessor`] consumes one stream in one scope on behalf
//! of one [`EventProcessor`]. It exclusively owns its [`ProcessorState`]
//! and persists it after every state-changing step, so a restart resumes
//! from the last persisted position. Delivery is at-least-once.
//!
//! ## Partitioned streams
//!
//! Each iteration first catches up failing partitions whose retry time has
//! come (see [`FailingPartitions`]), then processes the event at the main
//! position. A failing event is recorded as a failing partition and the
//! main position moves on, so other partitions keep flowing. Later events
//! of a failing partition are skipped on the main path and picked up by
//! catch-up, which preserves per-partition order.
//!
//! ## Unpartitioned streams
//!
//! A failing event blocks the stream: the position stays put until the
//! event is processed successfully on a later retry.
//!
//! ## Waiting
//!
//! With nothing to do, the loop suspends on the [`StreamEventWatcher`]
//! until the next position is committed, bounded by the earliest pending
//! retry and [`StreamProcessorConfig::idle_wait`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::StreamProcessorConfig;
use crate::error::ProcessorError;
use crate::event::StreamEvent;
use crate::event_processor::{EventProcessor, ProcessingResult};
use crate::failing_partitions::FailingPartitions;
use crate::fetcher::{EventFetcher, fetch_with_retries};
use crate::ids::{StreamPosition, StreamProcessorId, TenantId};
use crate::repository::{ResilientStreamProcessorStateRepository, StreamProcessorStateRepository};
use crate::state::{
    FailingPartitionState, ProcessingFailure, ProcessorState, StreamProcessorState,
    UnpartitionedStreamProcessorState,
};
use crate::time_to_retry::time_to_retry;
use crate::watcher::{StreamEventWatcher, cancelled};

/// What a stream processor is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorActivity {
    /// Created but the loop has not started yet.
    Starting,
    /// Dispatching an event on the main path.
    Processing,
    /// Retrying failing partitions or a blocked unpartitioned event.
    CatchingUp,
    /// Waiting for new events or a retry time.
    Idle,
    /// The loop has exited.
    Stopped,
}

/// Read-only snapshot of a stream processor for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProcessorStatus {
    pub state: ProcessorState,
    pub activity: ProcessorActivity,
    /// Version of the last persisted state, `None` if never persisted.
    pub version: Option<u64>,
}

/// Result of a single processing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// State changed and was persisted.
    Progressed,
    /// No event exists at the main position yet.
    AwaitingEvent,
    /// The next event is blocked until a retry time is reached.
    AwaitingRetry,
}

/// Messages accepted by a running processor between iterations.
#[derive(Debug)]
pub(crate) enum ProcessorCommand {
    /// Force the main position and persist it.
    SetToPosition {
        position: StreamPosition,
        /// Completed once the new position has been persisted.
        reply: oneshot::Sender<()>,
    },
}

/// Collaborators shared by every stream processor of a tenant.
#[derive(Debug, Clone)]
pub struct ProcessorServices {
    pub watcher: StreamEventWatcher,
    pub repository: ResilientStreamProcessorStateRepository,
    pub clock: Arc<dyn Clock>,
    pub config: StreamProcessorConfig,
}

/// Control side of a [`ScopedStreamProcessor`].
///
/// Returned by [`ScopedStreamProcessor::new`]. Dropping the controller
/// does not stop the processor, but leaves it without a way to be
/// cancelled.
#[derive(Debug)]
pub struct StreamProcessorController {
    commands: mpsc::Sender<ProcessorCommand>,
    status: watch::Receiver<StreamProcessorStatus>,
    shutdown: watch::Sender<bool>,
}

impl StreamProcessorController {
    /// Force the processor's main position.
    ///
    /// The request is applied between iterations and completes once the
    /// new position has been persisted. Failing partitions are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::NotRunning`] if the processor has stopped
    /// or stops before persisting the new position.
    pub async fn set_to_position(&self, position: StreamPosition) -> Result<(), ProcessorError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(ProcessorCommand::SetToPosition { position, reply })
            .await
            .map_err(|_| ProcessorError::NotRunning)?;
        done.await.map_err(|_| ProcessorError::NotRunning)
    }

    /// Latest status published by the processor.
    pub fn status(&self) -> StreamProcessorStatus {
        self.status.borrow().clone()
    }

    /// Snapshot of the processor's current state.
    pub fn current_state(&self) -> ProcessorState {
        self.status.borrow().state.clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<StreamProcessorStatus> {
        self.status.clone()
    }

    /// Signal the processor to stop after its current dispatch.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Processes one stream for one event processor in one scope.
pub struct ScopedStreamProcessor {
    tenant: TenantId,
    id: StreamProcessorId,
    state: ProcessorState,
    version: Option<u64>,
    event_processor: Arc<dyn EventProcessor>,
    fetcher: Arc<dyn EventFetcher>,
    watcher: StreamEventWatcher,
    repository: ResilientStreamProcessorStateRepository,
    clock: Arc<dyn Clock>,
    config: StreamProcessorConfig,
    catchup: FailingPartitions,
    commands: mpsc::Receiver<ProcessorCommand>,
    commands_open: bool,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<StreamProcessorStatus>,
}

impl ScopedStreamProcessor {
    /// Create a processor and its controller.
    ///
    /// The variant follows `initial`: a [`ProcessorState::Partitioned`]
    /// state yields a partitioned processor.
    ///
    /// # Arguments
    ///
    /// * `tenant` - Tenant the processor runs for.
    /// * `id` - Identity of the processor.
    /// * `initial` - State to resume from.
    /// * `version` - Version of `initial` in the repository, `None` if it
    ///   was never persisted.
    /// * `event_processor` - Business logic invoked for every event.
    /// * `fetcher` - Source of the stream's events.
    /// * `services` - Shared watcher, repository, clock and configuration.
    pub fn new(
        tenant: TenantId,
        id: StreamProcessorId,
        initial: ProcessorState,
        version: Option<u64>,
        event_processor: Arc<dyn EventProcessor>,
        fetcher: Arc<dyn EventFetcher>,
        services: &ProcessorServices,
    ) -> (Self, StreamProcessorController) {
        let (commands_tx, commands) = mpsc::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (status, status_rx) = watch::channel(StreamProcessorStatus {
            state: initial.clone(),
            activity: ProcessorActivity::Starting,
            version,
        });
        let catchup = FailingPartitions::new(
            id,
            event_processor.clone(),
            fetcher.clone(),
            services.clock.clone(),
            services.config.backoff,
            services.config.fetch_retry.clone(),
            services.config.max_concurrent_catchups,
        );
        let processor = Self {
            tenant,
            id,
            state: initial,
            version,
            event_processor,
            fetcher,
            watcher: services.watcher.clone(),
            repository: services.repository.clone(),
            clock: services.clock.clone(),
            config: services.config.clone(),
            catchup,
            commands,
            commands_open: true,
            shutdown,
            status,
        };
        let controller = StreamProcessorController {
            commands: commands_tx,
            status: status_rx,
            shutdown: shutdown_tx,
        };
        (processor, controller)
    }

    pub fn id(&self) -> StreamProcessorId {
        self.id
    }

    pub fn current_state(&self) -> &ProcessorState {
        &self.state
    }

    /// Run the processing loop until cancelled or a fatal error occurs.
    ///
    /// Every state change is persisted before the next step, so
    /// cancellation never loses progress and an idle processor exits
    /// without writing.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::Fetch`] if events cannot be read after retries.
    /// - [`ProcessorError::Persistence`] if state cannot be persisted after
    ///   retries, or another owner persisted it first.
    pub async fn start(mut self) -> Result<(), ProcessorError> {
        let span = tracing::info_span!(
            "stream_processor",
            tenant = %self.tenant,
            stream_processor_id = %self.id,
            kind = %self.event_processor.kind(),
            partitioned = self.state.is_partitioned(),
        );
        async move {
            tracing::info!(position = %self.state.position(), "stream processor started");
            let result = self.run().await;
            self.publish(ProcessorActivity::Stopped);
            match &result {
                Ok(()) => {
                    tracing::info!(position = %self.state.position(), "stream processor stopped")
                }
                Err(e) => tracing::error!(error = %e, "stream processor failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&mut self) -> Result<(), ProcessorError> {
        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            self.drain_commands().await?;
            match self.step().await? {
                StepOutcome::Progressed => {}
                StepOutcome::AwaitingEvent => self.wait(true).await?,
                StepOutcome::AwaitingRetry => self.wait(false).await?,
            }
        }
    }

    /// Run a single iteration: catch up, then process the next event.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn step(&mut self) -> Result<StepOutcome, ProcessorError> {
        match self.state.clone() {
            ProcessorState::Partitioned(state) => self.step_partitioned(state).await,
            ProcessorState::Unpartitioned(state) => self.step_unpartitioned(state).await,
        }
    }

    async fn step_partitioned(
        &mut self,
        state: StreamProcessorState,
    ) -> Result<StepOutcome, ProcessorError> {
        let mut progressed = false;
        let mut state = if state
            .failing_partitions
            .values()
            .any(|failing| failing.is_ready(self.clock.now()))
        {
            self.publish(ProcessorActivity::CatchingUp);
            let caught_up = self.catchup.catchup_all(state.clone(), &self.shutdown).await?;
            if caught_up != state {
                self.commit(caught_up.clone().into()).await?;
                progressed = true;
            }
            caught_up
        } else {
            state
        };
        if self.is_cancelled() {
            return Ok(StepOutcome::Progressed);
        }

        let Some(event) = self.fetch(state.position).await? else {
            return Ok(if progressed {
                StepOutcome::Progressed
            } else {
                StepOutcome::AwaitingEvent
            });
        };

        if state.is_behind(&event.partition, event.position) {
            tracing::debug!(
                partition = %event.partition,
                position = %event.position,
                "partition is failing, deferring event to catch-up"
            );
        } else {
            self.publish(ProcessorActivity::Processing);
            let result = self
                .event_processor
                .process(&event.event, &event.partition)
                .await;
            let now = self.clock.now();
            // A record at or after this event is stale once the main path
            // reaches it again.
            let previous = state.failing_partitions.remove(&event.partition);
            if result.succeeded() {
                state.last_successfully_processed = now;
            } else {
                let attempts = previous
                    .filter(|failing| failing.position == event.position)
                    .map_or(1, |failing| failing.processing_attempts.saturating_add(1));
                let reason = result.reason().unwrap_or_default().to_string();
                log_failure(&result, &event, attempts, "processing failed, partition is now failing");
                state.failing_partitions.insert(
                    event.partition.clone(),
                    FailingPartitionState {
                        position: event.position,
                        retry_time: self.config.backoff.retry_time_after(&result, now, attempts),
                        reason,
                        processing_attempts: attempts,
                        last_failed: now,
                    },
                );
            }
        }
        state.position = event.position.next();
        self.commit(state.into()).await?;
        Ok(StepOutcome::Progressed)
    }

    async fn step_unpartitioned(
        &mut self,
        mut state: UnpartitionedStreamProcessorState,
    ) -> Result<StepOutcome, ProcessorError> {
        if let Some(failure) = &state.failure
            && failure.retry_time > self.clock.now()
        {
            return Ok(StepOutcome::AwaitingRetry);
        }
        let Some(event) = self.fetch(state.position).await? else {
            return Ok(StepOutcome::AwaitingEvent);
        };

        let result = match &state.failure {
            Some(failure) => {
                self.publish(ProcessorActivity::CatchingUp);
                self.event_processor
                    .process_retry(
                        &event.event,
                        &event.partition,
                        &failure.reason,
                        failure.processing_attempts,
                    )
                    .await
            }
            None => {
                self.publish(ProcessorActivity::Processing);
                self.event_processor
                    .process(&event.event, &event.partition)
                    .await
            }
        };

        let now = self.clock.now();
        if result.succeeded() {
            state.position = event.position.next();
            state.failure = None;
            state.last_successfully_processed = now;
        } else {
            let attempts = state
                .failure
                .as_ref()
                .map_or(1, |failure| failure.processing_attempts.saturating_add(1));
            let reason = result.reason().unwrap_or_default().to_string();
            log_failure(&result, &event, attempts, "processing failed, stream is blocked");
            state.failure = Some(ProcessingFailure {
                retry_time: self.config.backoff.retry_time_after(&result, now, attempts),
                reason,
                processing_attempts: attempts,
                last_failed: now,
            });
        }
        self.commit(state.into()).await?;
        Ok(StepOutcome::Progressed)
    }

    /// Suspend until there may be work again.
    ///
    /// Wakes on a new event at the main position (if `for_event`), the
    /// earliest retry time, `idle_wait`, a command, or cancellation.
    async fn wait(&mut self, for_event: bool) -> Result<(), ProcessorError> {
        let mut timeout = self.config.idle_wait;
        if let Some(until_retry) = time_to_retry(&self.state, self.clock.now()) {
            timeout = timeout.min(until_retry);
        }
        if timeout == Duration::ZERO {
            return Ok(());
        }
        self.publish(ProcessorActivity::Idle);
        tracing::trace!(position = %self.state.position(), ?timeout, for_event, "waiting");

        let (scope, stream) = (self.id.scope_id, self.id.source_stream_id);
        let position = self.state.position();
        let watcher = &self.watcher;
        let commands = &mut self.commands;
        let mut shutdown = self.shutdown.clone();
        let waiting = async {
            if for_event {
                // Timeout and cancellation both just end the wait.
                let _ = watcher
                    .wait_for_event_with_timeout(scope, stream, position, timeout, &mut shutdown)
                    .await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = cancelled(&mut shutdown) => {}
                }
            }
        };

        let command = tokio::select! {
            () = waiting => None,
            command = commands.recv(), if self.commands_open => Some(command),
        };
        match command {
            None => Ok(()),
            Some(Some(command)) => self.handle_command(command).await,
            Some(None) => {
                self.commands_open = false;
                Ok(())
            }
        }
    }

    async fn drain_commands(&mut self) -> Result<(), ProcessorError> {
        while self.commands_open {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command).await?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.commands_open = false,
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: ProcessorCommand) -> Result<(), ProcessorError> {
        match command {
            ProcessorCommand::SetToPosition { position, reply } => {
                tracing::info!(from = %self.state.position(), to = %position, "setting stream processor position");
                let mut state = self.state.clone();
                state.set_position(position);
                self.commit(state).await?;
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, ProcessorError> {
        fetch_with_retries(
            self.fetcher.as_ref(),
            &self.config.fetch_retry,
            self.id.scope_id,
            self.id.source_stream_id,
            position,
        )
        .await
        .map_err(|e| {
            tracing::error!(%position, error = %e, "fetching event failed");
            ProcessorError::Fetch(e)
        })
    }

    /// Adopt `state` and persist it.
    async fn commit(&mut self, state: ProcessorState) -> Result<(), ProcessorError> {
        let version = self
            .repository
            .persist(&self.id, &state, self.version)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "persisting stream processor state failed");
                ProcessorError::Persistence(e)
            })?;
        self.state = state;
        self.version = Some(version);
        self.status.send_modify(|status| {
            status.state = self.state.clone();
            status.version = self.version;
        });
        Ok(())
    }

    fn publish(&self, activity: ProcessorActivity) {
        self.status.send_if_modified(|status| {
            if status.activity == activity {
                return false;
            }
            status.activity = activity;
            true
        });
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for ScopedStreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStreamProcessor")
            .field("tenant", &self.tenant)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Log a failed dispatch: permanent failures at `error`, retries at `warn`.
pub(crate) fn log_failure(result: &ProcessingResult, event: &StreamEvent, attempts: u32, message: &str) {
    let reason = result.reason().unwrap_or_default();
    if result.is_permanent() {
        tracing::error!(
            partition = %event.partition,
            position = %event.position,
            attempts,
            reason,
            "{message}"
        );
    } else {
        tracing::warn!(
            partition = %event.partition,
            position = %event.position,
            attempts,
            reason,
            "{message}"
        );
    }
}
