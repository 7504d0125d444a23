//! Stream processors for event-sourced runtimes.
//!
//! A stream processor consumes one event stream on behalf of an
//! [`EventProcessor`], persisting its position so it resumes after a
//! restart. Partitioned processors isolate failures per partition and
//! retry failing partitions in the background while the rest of the stream
//! keeps flowing; unpartitioned processors block on a failing event.
//! [`StreamProcessors`] registers and supervises processors per tenant.

mod clock;
mod config;
mod error;
mod event;
mod event_processor;
mod failing_partitions;
mod fetcher;
mod ids;
mod repository;
mod state;
mod store;
mod stream_processor;
mod stream_processors;
mod time_to_retry;
mod watcher;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, StreamProcessorConfig};
pub use error::{FetchError, ProcessorError, RegistrationError, RepositoryError, WatchError};
pub use event::{CommittedEvent, StreamEvent};
pub use event_processor::{EventProcessor, EventProcessorKind, ProcessingResult};
pub use failing_partitions::{FailingPartitions, PartitionCatchup};
pub use fetcher::{EventFetcher, PartitionEventStream};
pub use ids::{
    EventProcessorId, PartitionId, ProcessingPosition, ScopeId, StreamId, StreamPosition,
    StreamProcessorId, TenantId,
};
pub use repository::{
    FileStreamProcessorStateRepository, InMemoryStreamProcessorStateRepository,
    ResilientStreamProcessorStateRepository, StreamProcessorStateRepository, VersionedState,
};
pub use state::{
    FailingPartitionState, ProcessingFailure, ProcessorState, StreamProcessorState,
    UnpartitionedStreamProcessorState,
};
pub use store::InMemoryEventStore;
pub use stream_processor::{
    ProcessorActivity, ProcessorServices, ScopedStreamProcessor, StepOutcome,
    StreamProcessorController, StreamProcessorStatus,
};
pub use stream_processors::{StreamProcessorHandle, StreamProcessors, StreamProcessorsBuilder};
pub use time_to_retry::{BackoffPolicy, time_to_retry};
pub use watcher::StreamEventWatcher;
