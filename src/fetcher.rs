//! Read-side contract of the event store consumed by stream processors.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};

use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::event::StreamEvent;
use crate::ids::{PartitionId, ScopeId, StreamId, StreamPosition};

/// Boxed stream of events returned by [`EventFetcher::fetch_in_partition`].
pub type PartitionEventStream<'a> =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, FetchError>> + Send + 'a>>;

/// Fetches committed events from a stream.
///
/// # Contract
///
/// - Results are monotonic and consistent: an event once returned at a
///   position never changes.
/// - `fetch` returns `Ok(None)` when no event exists at the position yet.
/// - `fetch_in_partition` yields events of one partition in strictly
///   increasing position order, starting at or after `from`.
#[async_trait]
pub trait EventFetcher: Send + Sync + 'static {
    /// Fetch the event at exactly `position`.
    async fn fetch(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError>;

    /// Stream events of `partition` at or after `from`.
    fn fetch_in_partition<'a>(
        &'a self,
        scope: ScopeId,
        stream: StreamId,
        partition: &'a PartitionId,
        from: StreamPosition,
    ) -> PartitionEventStream<'a>;
}

/// Fetch a single event, retrying failures per `retry`.
///
/// # Errors
///
/// Returns the last [`FetchError`] once `retry.max_attempts` is exhausted.
pub(crate) async fn fetch_with_retries(
    fetcher: &dyn EventFetcher,
    retry: &RetryConfig,
    scope: ScopeId,
    stream: StreamId,
    position: StreamPosition,
) -> Result<Option<StreamEvent>, FetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(scope, stream, position).await {
            Ok(event) => return Ok(event),
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.delay_before_retry(attempt);
                tracing::warn!(%stream, %position, attempt, ?delay, error = %e, "fetch failed, will retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Collect the events of `partition` in `[from, until)`, retrying failures per `retry`.
///
/// A failed attempt restarts the read from `from`.
pub(crate) async fn fetch_partition_backlog(
    fetcher: &dyn EventFetcher,
    retry: &RetryConfig,
    scope: ScopeId,
    stream: StreamId,
    partition: &PartitionId,
    from: StreamPosition,
    until: StreamPosition,
) -> Result<Vec<StreamEvent>, FetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match read_partition(fetcher, scope, stream, partition, from, until).await {
            Ok(events) => return Ok(events),
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.delay_before_retry(attempt);
                tracing::warn!(%stream, %partition, attempt, ?delay, error = %e, "partition fetch failed, will retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_partition(
    fetcher: &dyn EventFetcher,
    scope: ScopeId,
    stream: StreamId,
    partition: &PartitionId,
    from: StreamPosition,
    until: StreamPosition,
) -> Result<Vec<StreamEvent>, FetchError> {
    let mut events = Vec::new();
    let mut backlog = fetcher.fetch_in_partition(scope, stream, partition, from);
    while let Some(event) = backlog.next().await {
        let event = event?;
        if event.position >= until {
            break;
        }
        events.push(event);
    }
    Ok(events)
}
