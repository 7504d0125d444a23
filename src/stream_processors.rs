//! Registry of running stream processors.
//!
//! [`StreamProcessors`] owns every [`ScopedStreamProcessor`] of the
//! process, keyed by tenant and [`StreamProcessorId`]. Registering loads
//! the persisted state (or persists a fresh one), spawns the processing
//! loop on the tokio runtime, and returns a [`StreamProcessorHandle`].
//! At most one processor runs per `(tenant, id)`; entries whose loop has
//! exited are evicted lazily, so a failed processor can be registered
//! again.
//!
//! Each tenant persists to its own repository, created on first use by
//! the factory configured on [`StreamProcessorsBuilder`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::StreamProcessorConfig;
use crate::error::{ProcessorError, RegistrationError};
use crate::event_processor::EventProcessor;
use crate::fetcher::EventFetcher;
use crate::ids::{ScopeId, StreamId, StreamPosition, StreamProcessorId, TenantId};
use crate::repository::{
    FileStreamProcessorStateRepository, InMemoryStreamProcessorStateRepository,
    ResilientStreamProcessorStateRepository, StreamProcessorStateRepository,
};
use crate::state::ProcessorState;
use crate::stream_processor::{
    ProcessorServices, ScopedStreamProcessor, StreamProcessorController, StreamProcessorStatus,
};
use crate::watcher::StreamEventWatcher;

type ProcessorKey = (TenantId, StreamProcessorId);
type Registered = HashMap<ProcessorKey, StreamProcessorHandle>;

/// Creates the state repository of a tenant.
type RepositoryFactory =
    Arc<dyn Fn(TenantId) -> Arc<dyn StreamProcessorStateRepository> + Send + Sync>;

/// Handle to a stream processor running in the background.
///
/// Cheap to clone; all clones control the same processor. Dropping every
/// handle does not stop the processor; use
/// [`shutdown`](StreamProcessorHandle::shutdown) or
/// [`StreamProcessors::unregister`].
#[derive(Debug, Clone)]
pub struct StreamProcessorHandle {
    tenant: TenantId,
    id: StreamProcessorId,
    controller: Arc<StreamProcessorController>,
    /// Taken and awaited exactly once by [`shutdown`](Self::shutdown).
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<(), ProcessorError>>>>>,
}

impl StreamProcessorHandle {
    fn spawn(tenant: TenantId, processor: ScopedStreamProcessor, controller: StreamProcessorController) -> Self {
        let id = processor.id();
        let task = tokio::spawn(processor.start());
        Self {
            tenant,
            id,
            controller: Arc::new(controller),
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn id(&self) -> StreamProcessorId {
        self.id
    }

    /// Whether the processing loop is still running.
    ///
    /// `false` once the loop has exited, whether by cancellation, a fatal
    /// error or a panic.
    pub fn is_running(&self) -> bool {
        self.controller.subscribe().has_changed().is_ok()
    }

    pub fn status(&self) -> StreamProcessorStatus {
        self.controller.status()
    }

    /// Read-only snapshot of the processor's state.
    pub fn current_state(&self) -> ProcessorState {
        self.controller.current_state()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<StreamProcessorStatus> {
        self.controller.subscribe()
    }

    /// Force the main position. See
    /// [`StreamProcessorController::set_to_position`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::NotRunning`] if the processor has stopped.
    pub async fn set_to_position(&self, position: StreamPosition) -> Result<(), ProcessorError> {
        self.controller.set_to_position(position).await
    }

    /// Signal the processor to stop and wait for its loop to exit.
    ///
    /// Calling `shutdown` more than once is safe: later calls return
    /// `Ok(())` immediately.
    ///
    /// # Returns
    ///
    /// The outcome of the processing loop.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`ProcessorError`] that stopped the loop, or
    /// [`ProcessorError::TaskFailed`] if the task panicked.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        self.controller.cancel();
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| ProcessorError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

/// All stream processors of this process, across tenants.
///
/// `Clone` is cheap: clones share the same registry.
#[derive(Clone)]
pub struct StreamProcessors {
    watcher: StreamEventWatcher,
    clock: Arc<dyn Clock>,
    config: StreamProcessorConfig,
    repository_factory: RepositoryFactory,
    repositories: Arc<DashMap<TenantId, ResilientStreamProcessorStateRepository>>,
    processors: Arc<RwLock<Registered>>,
    /// Keys whose registration is loading state, outside the registry lock.
    registering: Arc<DashMap<ProcessorKey, ()>>,
}

impl std::fmt::Debug for StreamProcessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessors")
            .field("config", &self.config)
            .field("tenants", &self.repositories.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to register one key, released on drop.
struct RegistrationClaim<'a> {
    registering: &'a DashMap<ProcessorKey, ()>,
    key: ProcessorKey,
}

impl<'a> RegistrationClaim<'a> {
    fn acquire(registering: &'a DashMap<ProcessorKey, ()>, key: ProcessorKey) -> Option<Self> {
        match registering.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { registering, key })
            }
        }
    }
}

impl Drop for RegistrationClaim<'_> {
    fn drop(&mut self) {
        self.registering.remove(&self.key);
    }
}

impl StreamProcessors {
    pub fn builder() -> StreamProcessorsBuilder {
        StreamProcessorsBuilder::new()
    }

    /// The watcher processors wait on. Committers notify it after appends.
    pub fn watcher(&self) -> &StreamEventWatcher {
        &self.watcher
    }

    /// State repository of `tenant`, with retries applied.
    pub fn repository(&self, tenant: TenantId) -> ResilientStreamProcessorStateRepository {
        self.repositories
            .entry(tenant)
            .or_insert_with(|| {
                ResilientStreamProcessorStateRepository::new(
                    (self.repository_factory)(tenant),
                    self.config.persistence_retry.clone(),
                )
            })
            .clone()
    }

    fn services(&self, tenant: TenantId) -> ProcessorServices {
        ProcessorServices {
            watcher: self.watcher.clone(),
            repository: self.repository(tenant),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }

    /// Register and start a stream processor.
    ///
    /// The processor's id is built from `scope`, the event processor's
    /// identifier and `source_stream`. A previously persisted state is
    /// resumed; otherwise a fresh state at position 0 is persisted first.
    ///
    /// # Arguments
    ///
    /// * `tenant` - Tenant the processor runs for.
    /// * `scope` - Scope of the source stream.
    /// * `source_stream` - Stream to process.
    /// * `event_processor` - Business logic invoked for every event.
    /// * `fetcher` - Source of the stream's events.
    /// * `partitioned` - Whether failures are isolated per partition.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::AlreadyRegistered`] if a processor with the
    ///   same id is running for `tenant`.
    /// - [`RegistrationError::PartitioningMismatch`] if the persisted state
    ///   belongs to the other variant.
    /// - [`RegistrationError::Repository`] if loading or creating the
    ///   state failed.
    pub async fn register(
        &self,
        tenant: TenantId,
        scope: ScopeId,
        source_stream: StreamId,
        event_processor: Arc<dyn EventProcessor>,
        fetcher: Arc<dyn EventFetcher>,
        partitioned: bool,
    ) -> Result<StreamProcessorHandle, RegistrationError> {
        let id = StreamProcessorId::new(scope, event_processor.identifier(), source_stream);
        let key = (tenant, id);

        let Some(_claim) = RegistrationClaim::acquire(&self.registering, key) else {
            return Err(RegistrationError::AlreadyRegistered { tenant, id });
        };
        {
            let mut processors = self.processors.write().await;
            if let Some(existing) = processors.get(&key) {
                if existing.is_running() {
                    return Err(RegistrationError::AlreadyRegistered { tenant, id });
                }
                processors.remove(&key);
            }
        }

        let services = self.services(tenant);
        let repository = &services.repository;
        let (state, version) = match repository.try_get(&id).await? {
            Some(stored) if stored.state.is_partitioned() != partitioned => {
                return Err(RegistrationError::PartitioningMismatch(id));
            }
            Some(stored) => (stored.state, stored.version),
            None => {
                let state = ProcessorState::initial(partitioned);
                let version = repository.persist(&id, &state, None).await?;
                (state, version)
            }
        };

        tracing::info!(
            %tenant,
            stream_processor_id = %id,
            kind = %event_processor.kind(),
            position = %state.position(),
            partitioned,
            "registering stream processor"
        );
        let (processor, controller) = ScopedStreamProcessor::new(
            tenant,
            id,
            state,
            Some(version),
            event_processor,
            fetcher,
            &services,
        );
        let handle = StreamProcessorHandle::spawn(tenant, processor, controller);
        self.processors.write().await.insert(key, handle.clone());
        Ok(handle)
    }

    /// Handle of a running processor, if any.
    pub async fn get(&self, tenant: TenantId, id: &StreamProcessorId) -> Option<StreamProcessorHandle> {
        let key = (tenant, *id);
        {
            let processors = self.processors.read().await;
            match processors.get(&key) {
                Some(handle) if handle.is_running() => return Some(handle.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Evict the exited processor.
        self.processors.write().await.remove(&key);
        None
    }

    /// Stop a processor and remove it from the registry.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if no processor was registered under `(tenant, id)`.
    ///
    /// # Errors
    ///
    /// Returns the fatal error the processor stopped with, if any.
    pub async fn unregister(&self, tenant: TenantId, id: &StreamProcessorId) -> Result<bool, ProcessorError> {
        let handle = self.processors.write().await.remove(&(tenant, *id));
        match handle {
            Some(handle) => {
                tracing::info!(%tenant, stream_processor_id = %id, "unregistering stream processor");
                handle.shutdown().await.map(|()| true)
            }
            None => Ok(false),
        }
    }

    /// Force the main position of a registered processor.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::NotRunning`] if no running processor is
    /// registered under `(tenant, id)`.
    pub async fn set_to_position(
        &self,
        tenant: TenantId,
        id: &StreamProcessorId,
        position: StreamPosition,
    ) -> Result<(), ProcessorError> {
        let handle = self.get(tenant, id).await.ok_or(ProcessorError::NotRunning)?;
        handle.set_to_position(position).await
    }

    /// Status of every registered processor of `tenant`, ordered by id.
    pub async fn current_states(&self, tenant: TenantId) -> Vec<(StreamProcessorId, StreamProcessorStatus)> {
        let processors = self.processors.read().await;
        let mut states: Vec<_> = processors
            .iter()
            .filter(|((owner, _), _)| *owner == tenant)
            .map(|((_, id), handle)| (*id, handle.status()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    /// Stop every processor and clear the registry.
    ///
    /// All processors are stopped even if some fail.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error reported by any processor.
    pub async fn shutdown_all(&self) -> Result<(), ProcessorError> {
        let drained: Vec<_> = self.processors.write().await.drain().collect();
        for (_, handle) in &drained {
            handle.controller.cancel();
        }
        let mut first_error = None;
        for ((tenant, id), handle) in drained {
            if let Err(e) = handle.shutdown().await {
                tracing::error!(%tenant, stream_processor_id = %id, error = %e, "stream processor stopped with error");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builder for [`StreamProcessors`].
///
/// Every setting is optional. Without a repository, each tenant keeps its
/// states in memory; without a clock, the system clock is used.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_processing::{StreamEventWatcher, StreamProcessorConfig, StreamProcessorsBuilder};
///
/// let watcher = StreamEventWatcher::new();
/// let processors = StreamProcessorsBuilder::new()
///     .state_dir(std::env::temp_dir().join("stream-processors"))
///     .watcher(watcher.clone())
///     .config(StreamProcessorConfig {
///         idle_wait: Duration::from_millis(250),
///         ..StreamProcessorConfig::default()
///     })
///     .build();
/// # let _ = processors;
/// ```
pub struct StreamProcessorsBuilder {
    repository_factory: Option<RepositoryFactory>,
    watcher: Option<StreamEventWatcher>,
    clock: Option<Arc<dyn Clock>>,
    config: StreamProcessorConfig,
}

impl StreamProcessorsBuilder {
    pub fn new() -> Self {
        Self {
            repository_factory: None,
            watcher: None,
            clock: None,
            config: StreamProcessorConfig::default(),
        }
    }

    /// Persist the states of every tenant through `repository`.
    ///
    /// Suited to single-tenant setups: the repository is keyed by stream
    /// processor id only. Repositories are wrapped with retries per
    /// [`StreamProcessorConfig::persistence_retry`].
    pub fn repository(mut self, repository: impl StreamProcessorStateRepository) -> Self {
        let shared: Arc<dyn StreamProcessorStateRepository> = Arc::new(repository);
        self.repository_factory = Some(Arc::new(move |_| shared.clone()));
        self
    }

    /// Create a separate repository for each tenant on first use.
    pub fn repository_per_tenant<R, F>(mut self, factory: F) -> Self
    where
        R: StreamProcessorStateRepository,
        F: Fn(TenantId) -> R + Send + Sync + 'static,
    {
        self.repository_factory = Some(Arc::new(move |tenant| {
            Arc::new(factory(tenant)) as Arc<dyn StreamProcessorStateRepository>
        }));
        self
    }

    /// Persist states as JSON files under `path/<tenant>`.
    ///
    /// Shorthand for a [`FileStreamProcessorStateRepository`] per tenant.
    pub fn state_dir(self, path: impl AsRef<Path>) -> Self {
        let base_dir = path.as_ref().to_owned();
        self.repository_per_tenant(move |tenant| {
            FileStreamProcessorStateRepository::new(base_dir.join(tenant.to_string()))
        })
    }

    /// Share an existing watcher, typically the one the event store notifies.
    pub fn watcher(mut self, watcher: StreamEventWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn config(mut self, config: StreamProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> StreamProcessors {
        let repository_factory = self.repository_factory.unwrap_or_else(|| {
            Arc::new(|_| {
                Arc::new(InMemoryStreamProcessorStateRepository::new())
                    as Arc<dyn StreamProcessorStateRepository>
            })
        });
        StreamProcessors {
            watcher: self.watcher.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            repository_factory,
            repositories: Arc::new(DashMap::new()),
            processors: Arc::new(RwLock::new(HashMap::new())),
            registering: Arc::new(DashMap::new()),
        }
    }
}

impl Default for StreamProcessorsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
