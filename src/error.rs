//! Crate-level error types for fetching, persistence, watching and
//! stream processor lifecycles.

use crate::ids::{StreamProcessorId, TenantId};

/// Error returned when reading events from the store fails.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Disk or network I/O failure in the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not serve the request right now.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by a [`StreamProcessorStateRepository`](crate::StreamProcessorStateRepository).
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The stored version changed since it was read.
    ///
    /// Another owner wrote the state for this stream processor. This is
    /// never retried: the current owner must stop.
    #[error(
        "concurrency conflict persisting stream processor {id}: expected version {expected:?}, found {actual:?}"
    )]
    ConcurrencyConflict {
        id: StreamProcessorId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only I/O failures are transient. Conflicts and serialization failures
    /// fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Error returned when waiting on the [`StreamEventWatcher`](crate::StreamEventWatcher).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The wait was cancelled before the position became available.
    #[error("wait for event was cancelled")]
    Cancelled,
}

/// Fatal outcome of a stream processor run.
///
/// Event processing failures never appear here; they are recorded as
/// failing partitions and retried.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Persisting state failed after all retries, or hit a concurrency conflict.
    #[error("failed to persist stream processor state: {0}")]
    Persistence(#[source] RepositoryError),

    /// Fetching events failed after all retries.
    #[error("failed to fetch events: {0}")]
    Fetch(#[source] FetchError),

    /// The stream processor has stopped and no longer accepts requests.
    #[error("stream processor is not running")]
    NotRunning,

    /// The background task running the processor panicked or was aborted.
    #[error("stream processor task failed: {0}")]
    TaskFailed(String),
}

/// Error returned when registering a stream processor.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A processor with this id is already running for the tenant.
    #[error("stream processor {id} is already registered for tenant {tenant}")]
    AlreadyRegistered {
        tenant: TenantId,
        id: StreamProcessorId,
    },

    /// Loading the persisted state failed.
    #[error("failed to load stream processor state: {0}")]
    Repository(#[from] RepositoryError),

    /// The persisted state belongs to the other processor variant.
    #[error("persisted state for {0} does not match the requested partitioning")]
    PartitioningMismatch(StreamProcessorId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EventProcessorId, ScopeId, StreamId};

    fn id() -> StreamProcessorId {
        StreamProcessorId::new(ScopeId::DEFAULT, EventProcessorId::new(), StreamId::new())
    }

    #[test]
    fn only_io_repository_errors_are_transient() {
        let io = RepositoryError::from(std::io::Error::other("disk busy"));
        assert!(io.is_transient());

        let conflict = RepositoryError::ConcurrencyConflict {
            id: id(),
            expected: Some(1),
            actual: Some(2),
        };
        assert!(!conflict.is_transient());

        let serde_err = serde_json::from_str::<u64>("nope").expect_err("invalid json");
        assert!(!RepositoryError::from(serde_err).is_transient());
    }

    #[test]
    fn conflict_display_names_versions() {
        let err = RepositoryError::ConcurrencyConflict {
            id: id(),
            expected: Some(3),
            actual: Some(4),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version Some(3)"));
        assert!(msg.contains("found Some(4)"));
    }

    #[test]
    fn watch_cancelled_display() {
        assert_eq!(
            WatchError::Cancelled.to_string(),
            "wait for event was cancelled"
        );
    }

    #[test]
    fn processor_error_wraps_repository_error() {
        let err = ProcessorError::Persistence(RepositoryError::from(std::io::Error::other("boom")));
        assert!(err.to_string().contains("boom"));
    }

    // Errors must cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync + 'static>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<FetchError>();
            assert_send_sync::<RepositoryError>();
            assert_send_sync::<WatchError>();
            assert_send_sync::<ProcessorError>();
            assert_send_sync::<RegistrationError>();
        }
    };
}
