//! Persistence of stream processor state.
//!
//! The [`StreamProcessorStateRepository`] trait is the contract; two
//! backends are provided:
//!
//! - [`InMemoryStreamProcessorStateRepository`] for tests and ephemeral use.
//! - [`FileStreamProcessorStateRepository`], one JSON file per stream
//!   processor, written atomically via temp-file + rename.
//!
//! Both enforce optimistic concurrency: every successful write bumps a
//! version, and a write carrying a stale expected version is rejected.
//! [`ResilientStreamProcessorStateRepository`] wraps any backend with
//! retries for transient failures.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RetryConfig;
use crate::error::RepositoryError;
use crate::ids::StreamProcessorId;
use crate::state::ProcessorState;

/// A persisted state together with its version token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    pub state: ProcessorState,
    pub version: u64,
}

/// Stores and retrieves [`ProcessorState`] by [`StreamProcessorId`].
///
/// # Contract
///
/// - `persist` with `expected_version == None` succeeds only if no state is
///   stored yet; with `Some(v)` only if the stored version is `v`.
/// - A successful `persist` returns the new version, strictly greater than
///   the previous one.
/// - A stale expected version fails with
///   [`RepositoryError::ConcurrencyConflict`].
#[async_trait]
pub trait StreamProcessorStateRepository: Send + Sync + 'static {
    async fn try_get(&self, id: &StreamProcessorId) -> Result<Option<VersionedState>, RepositoryError>;

    async fn persist(
        &self,
        id: &StreamProcessorId,
        state: &ProcessorState,
        expected_version: Option<u64>,
    ) -> Result<u64, RepositoryError>;
}

fn check_version(
    id: &StreamProcessorId,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Result<u64, RepositoryError> {
    if expected != actual {
        return Err(RepositoryError::ConcurrencyConflict {
            id: *id,
            expected,
            actual,
        });
    }
    Ok(actual.map_or(1, |v| v + 1))
}

// --- In-memory backend ---

/// Repository keeping all states in process memory.
///
/// `Clone` is cheap: clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreamProcessorStateRepository {
    states: Arc<RwLock<HashMap<StreamProcessorId, VersionedState>>>,
}

impl InMemoryStreamProcessorStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamProcessorStateRepository for InMemoryStreamProcessorStateRepository {
    async fn try_get(&self, id: &StreamProcessorId) -> Result<Option<VersionedState>, RepositoryError> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn persist(
        &self,
        id: &StreamProcessorId,
        state: &ProcessorState,
        expected_version: Option<u64>,
    ) -> Result<u64, RepositoryError> {
        let mut states = self.states.write().await;
        let actual = states.get(id).map(|stored| stored.version);
        let version = check_version(id, expected_version, actual)?;
        states.insert(
            *id,
            VersionedState {
                state: state.clone(),
                version,
            },
        );
        Ok(version)
    }
}

// --- File backend ---

/// Repository storing one JSON file per stream processor.
///
/// Layout:
/// ```text
/// <base_dir>/
///     <scope_id>/
///         <event_processor_id>/
///             <source_stream_id>.json
/// ```
///
/// Writes go to a `.json.tmp` sibling first and are renamed into place, so
/// readers never see a partially written file. A corrupt file is treated as
/// missing. A per-repository lock serializes read-check-write sequences so
/// the version check is atomic within one process.
#[derive(Debug, Clone)]
pub struct FileStreamProcessorStateRepository {
    base_dir: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileStreamProcessorStateRepository {
    /// Create a repository rooted at `base_dir`.
    ///
    /// The directory is created lazily on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the state file for `id`.
    pub fn state_path(&self, id: &StreamProcessorId) -> PathBuf {
        self.base_dir
            .join(id.scope_id.to_string())
            .join(id.event_processor_id.to_string())
            .join(format!("{}.json", id.source_stream_id))
    }
}

/// Load a versioned state file.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt.
fn load_state_file(path: &Path) -> io::Result<Option<VersionedState>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt stream processor state, treating as missing"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Save a versioned state file atomically.
fn save_state_file(path: &Path, state: &VersionedState) -> Result<(), RepositoryError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[async_trait]
impl StreamProcessorStateRepository for FileStreamProcessorStateRepository {
    async fn try_get(&self, id: &StreamProcessorId) -> Result<Option<VersionedState>, RepositoryError> {
        let path = self.state_path(id);
        let loaded = tokio::task::spawn_blocking(move || load_state_file(&path))
            .await
            .map_err(io::Error::other)??;
        Ok(loaded)
    }

    async fn persist(
        &self,
        id: &StreamProcessorId,
        state: &ProcessorState,
        expected_version: Option<u64>,
    ) -> Result<u64, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let path = self.state_path(id);
        let id = *id;
        let state = state.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, RepositoryError> {
            let actual = load_state_file(&path)?.map(|stored| stored.version);
            let version = check_version(&id, expected_version, actual)?;
            save_state_file(&path, &VersionedState { state, version })?;
            Ok(version)
        })
        .await
        .map_err(io::Error::other)?
    }
}

// --- Resilient wrapper ---

/// Retries transient repository failures with exponential backoff.
///
/// Only errors for which [`RepositoryError::is_transient`] holds are
/// retried. Concurrency conflicts surface immediately.
#[derive(Clone)]
pub struct ResilientStreamProcessorStateRepository {
    inner: Arc<dyn StreamProcessorStateRepository>,
    retry: RetryConfig,
}

impl std::fmt::Debug for ResilientStreamProcessorStateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStreamProcessorStateRepository")
            .field("retry", &self.retry)
            .finish()
    }
}

impl ResilientStreamProcessorStateRepository {
    pub fn new(inner: Arc<dyn StreamProcessorStateRepository>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, RepositoryError>> + Send,
        T: Send,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < self.retry.max_attempts => {
                    let delay = self.retry.delay_before_retry(tries);
                    tracing::warn!(
                        operation,
                        attempt = tries,
                        ?delay,
                        error = %e,
                        "stream processor state repository failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StreamProcessorStateRepository for ResilientStreamProcessorStateRepository {
    async fn try_get(&self, id: &StreamProcessorId) -> Result<Option<VersionedState>, RepositoryError> {
        let inner = &self.inner;
        self.with_retries("try_get", move || inner.try_get(id)).await
    }

    async fn persist(
        &self,
        id: &StreamProcessorId,
        state: &ProcessorState,
        expected_version: Option<u64>,
    ) -> Result<u64, RepositoryError> {
        let inner = &self.inner;
        self.with_retries("persist", move || inner.persist(id, state, expected_version))
            .await
    }
}
