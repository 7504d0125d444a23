//! Position-based wake-up for stream processors waiting on new events.
//!
//! The watcher keeps one bucket per `(scope, stream)`. Each bucket holds a
//! `tokio::sync::watch` channel carrying the highest position notified so
//! far. Waiters subscribe to the bucket and complete as soon as the value
//! reaches their requested position, so a single notification wakes every
//! waiter at or below it while leaving higher waiters pending. Buckets live
//! in a sharded map, so unrelated streams never contend on the same lock.
//!
//! The watcher is a wake-up optimization, not a source of truth: callers
//! must always try to fetch from the store before waiting.
//!
//! A bucket that was only waited on, never notified, is dropped when its
//! last waiter leaves. Notified buckets are kept so a later waiter still
//! sees the highest position.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::WatchError;
use crate::ids::{ScopeId, StreamId, StreamPosition};

type BucketKey = (ScopeId, StreamId);

/// Registry of waiters keyed by `(scope, stream)`.
///
/// `Clone` is cheap: the bucket map is `Arc`-wrapped and shared between
/// clones, so committers and stream processors can each hold a clone.
#[derive(Debug, Clone, Default)]
pub struct StreamEventWatcher {
    buckets: Arc<DashMap<BucketKey, watch::Sender<Option<StreamPosition>>>>,
}

impl StreamEventWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that the event at `position` has been committed.
    ///
    /// Wakes every waiter on `(scope, stream)` whose requested position is
    /// at or below `position`. Notifications lower than one already seen
    /// are ignored.
    pub fn notify_for_event(&self, scope: ScopeId, stream: StreamId, position: StreamPosition) {
        let bucket = self
            .buckets
            .entry((scope, stream))
            .or_insert_with(|| watch::channel(None).0);
        bucket.send_if_modified(|highest| match highest {
            Some(current) if *current >= position => false,
            _ => {
                *highest = Some(position);
                true
            }
        });
        tracing::trace!(%scope, %stream, %position, "notified for event");
    }

    /// Highest position notified for `(scope, stream)`, if any.
    pub fn highest_notified(&self, scope: ScopeId, stream: StreamId) -> Option<StreamPosition> {
        self.buckets
            .get(&(scope, stream))
            .and_then(|bucket| *bucket.borrow())
    }

    /// Wait until an event at or above `position` has been notified.
    ///
    /// Completes immediately if such a notification was already observed.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Cancelled`] if `shutdown` becomes `true` first.
    pub async fn wait_for_event(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        if *shutdown.borrow() {
            return Err(WatchError::Cancelled);
        }
        // Declared before `rx` so it runs after the receiver is dropped.
        let _release = BucketRelease {
            buckets: &self.buckets,
            key: (scope, stream),
        };
        let mut rx = self.subscribe(scope, stream);

        tokio::select! {
            reached = rx.wait_for(|highest| highest.is_some_and(|p| p >= position)) => {
                // Only unnotified buckets are ever removed, and never while subscribed.
                reached.map(|_| ()).map_err(|_| WatchError::Cancelled)
            }
            _ = cancelled(shutdown) => Err(WatchError::Cancelled),
        }
    }

    /// Like [`wait_for_event`](Self::wait_for_event), bounded by `timeout`.
    ///
    /// # Returns
    ///
    /// `true` if the position was reached, `false` if the timeout elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Cancelled`] if `shutdown` becomes `true` first.
    pub async fn wait_for_event_with_timeout(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, WatchError> {
        match tokio::time::timeout(
            timeout,
            self.wait_for_event(scope, stream, position, shutdown),
        )
        .await
        {
            Ok(result) => result.map(|()| true),
            Err(_elapsed) => Ok(false),
        }
    }

    fn subscribe(&self, scope: ScopeId, stream: StreamId) -> watch::Receiver<Option<StreamPosition>> {
        self.buckets
            .entry((scope, stream))
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

/// Drops a bucket that has no waiters left and was never notified.
struct BucketRelease<'a> {
    buckets: &'a DashMap<BucketKey, watch::Sender<Option<StreamPosition>>>,
    key: BucketKey,
}

impl Drop for BucketRelease<'_> {
    fn drop(&mut self) {
        self.buckets.remove_if(&self.key, |_, sender| {
            sender.receiver_count() == 0 && sender.borrow().is_none()
        });
    }
}

/// Resolves once `shutdown` flips to `true`.
///
/// Never resolves if the sending side is gone without signalling.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
