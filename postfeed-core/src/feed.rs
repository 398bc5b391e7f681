//! Live per-scope snapshots fanned out to any number of subscribers.
//!
//! Each scope owns one immutable id → post map behind an `Arc`. Writers build
//! a new map and swap it in while holding the scope's write lock, and publish
//! the full snapshot to every subscriber queue before releasing it. Readers
//! clone the `Arc` and never observe a half-applied merge.
//!
//! Subscriber queues are unbounded, so a slow subscriber accumulates backlog
//! instead of stalling a refresh. A subscriber leaves the scope's set exactly
//! once: on cancellation, on drop, or when a publish finds its queue closed.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::FeedError;
use crate::post::{PostSummary, StreamOptions};
use crate::stream::{ContentStream, ProgressSender};

/// One published snapshot, shared between all subscribers that receive it.
pub type SnapshotItems = Arc<[PostSummary]>;

type Snapshot = BTreeMap<i64, PostSummary>;
type Outbox = mpsc::UnboundedSender<SnapshotItems>;

#[derive(Debug, Default)]
struct ScopeState {
    snapshot: RwLock<Arc<Snapshot>>,
    subscribers: DashMap<Uuid, Outbox>,
}

impl ScopeState {
    fn write(&self) -> RwLockWriteGuard<'_, Arc<Snapshot>> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Arc<Snapshot> {
        self.read_guard().clone()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Arc<Snapshot>> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_subscriber(&self, id: &Uuid) -> bool {
        self.subscribers.remove(id).is_some()
    }

    /// Sends `snapshot` to every subscriber and drops those whose queue is
    /// gone. Callers hold the snapshot write lock so publish order matches
    /// replacement order.
    fn broadcast(&self, scope: &str, snapshot: &Snapshot) {
        if self.subscribers.is_empty() {
            return;
        }
        let items: SnapshotItems = snapshot.values().cloned().collect();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(items.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        // removal outside the iteration: DashMap shards are still read-locked there
        for id in dead {
            if self.remove_subscriber(&id) {
                debug!(scope = %scope, subscriber = %id, "dropped closed subscriber");
            }
        }
    }
}

/// The authoritative in-memory view of every scope.
///
/// Cheap to share behind an `Arc`; all operations take `&self` and may be
/// called concurrently for the same or different scopes.
pub struct PostFeed {
    stream: Arc<dyn ContentStream>,
    options: StreamOptions,
    scopes: DashMap<String, Arc<ScopeState>>,
}

impl std::fmt::Debug for PostFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostFeed")
            .field("options", &self.options)
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

impl PostFeed {
    pub fn new(stream: Arc<dyn ContentStream>) -> Self {
        Self::with_options(stream, StreamOptions::default())
    }

    pub fn with_options(stream: Arc<dyn ContentStream>, options: StreamOptions) -> Self {
        Self {
            stream,
            options,
            scopes: DashMap::new(),
        }
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    fn scope(&self, scope: &str) -> Arc<ScopeState> {
        if let Some(state) = self.scopes.get(scope) {
            return state.clone();
        }
        self.scopes.entry(scope.to_owned()).or_default().clone()
    }

    fn existing_scope(&self, scope: &str) -> Option<Arc<ScopeState>> {
        self.scopes.get(scope).map(|state| state.clone())
    }

    /// Registers a subscriber. When the scope already has posts, the current
    /// snapshot is queued immediately.
    pub fn subscribe(&self, scope: &str) -> Subscription {
        let state = self.scope(scope);
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            // registration and the initial value are ordered against publishes
            let guard = state.write();
            if !guard.is_empty() {
                let items: SnapshotItems = guard.values().cloned().collect();
                let _ = tx.send(items);
            }
            state.subscribers.insert(id, tx);
        }
        debug!(scope = %scope, subscriber = %id, "subscribed");
        Subscription {
            handle: SubscriptionHandle {
                id,
                scope: scope.to_owned(),
                state,
                ended: Arc::new(Notify::new()),
            },
            rx,
        }
    }

    /// Like [`subscribe`](Self::subscribe), cancelled once `signal` resolves.
    /// The watcher task exits early if the subscription is cancelled or
    /// dropped first.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn subscribe_until<F>(&self, scope: &str, signal: F) -> Subscription
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.subscribe(scope);
        let handle = subscription.handle();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal => {
                    handle.cancel();
                }
                _ = handle.ended.notified() => {}
            }
        });
        subscription
    }

    /// Runs one cache-then-fresh pass and publishes the merged snapshot after
    /// every batch.
    ///
    /// A failed pass returns the error and leaves the snapshot at its last
    /// merged state.
    pub async fn refresh(&self, scope: &str) -> Result<(), FeedError> {
        self.refresh_with_progress(scope, None).await
    }

    pub async fn refresh_with_progress(
        &self,
        scope: &str,
        progress: Option<ProgressSender>,
    ) -> Result<(), FeedError> {
        let state = self.scope(scope);
        info!(scope = %scope, "refresh started");
        let mut batches = self
            .stream
            .stream_cached_then_fresh(scope, self.options, progress);
        let mut merged = 0usize;
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            merged += batch.len();
            merge(&state, scope, batch);
        }
        info!(scope = %scope, merged, "refresh finished");
        Ok(())
    }

    /// Point-in-time copy of the scope's posts; empty for an unknown scope.
    pub fn current(&self, scope: &str) -> Vec<PostSummary> {
        self.existing_scope(scope)
            .map(|state| state.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Optimistically removes `id` from the scope and publishes the smaller
    /// snapshot. Returns `false` (and publishes nothing) if `id` is absent.
    pub fn evict(&self, scope: &str, id: i64) -> bool {
        let Some(state) = self.existing_scope(scope) else {
            return false;
        };
        let mut guard = state.write();
        if !guard.contains_key(&id) {
            debug!(scope = %scope, id, "evict of unknown post ignored");
            return false;
        }
        let mut next = Snapshot::clone(&guard);
        next.remove(&id);
        let next = Arc::new(next);
        *guard = next.clone();
        state.broadcast(scope, &next);
        debug!(scope = %scope, id, "evicted post");
        true
    }

    /// Marks the scope's state as stale. This changes nothing and publishes
    /// nothing; follow it with [`refresh`](Self::refresh).
    pub fn invalidate(&self, scope: &str) {
        debug!(scope = %scope, "invalidated");
    }

    pub fn subscriber_count(&self, scope: &str) -> usize {
        self.existing_scope(scope)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }
}

fn merge(state: &ScopeState, scope: &str, batch: Vec<PostSummary>) {
    let mut guard = state.write();
    let mut next = Snapshot::clone(&guard);
    for post in batch {
        next.insert(post.id, post);
    }
    let next = Arc::new(next);
    *guard = next.clone();
    state.broadcast(scope, &next);
}

/// Cancels a [`Subscription`] from anywhere. Cancelling twice is a no-op.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    scope: String,
    state: Arc<ScopeState>,
    ended: Arc<Notify>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Removes the subscriber; its queue closes once buffered snapshots are
    /// drained. Returns whether this call did the removal.
    ///
    /// Waits for a publish already in progress, so that publish is still
    /// delivered.
    pub fn cancel(&self) -> bool {
        let removed = {
            let _snapshot = self.state.read_guard();
            self.state.remove_subscriber(&self.id)
        };
        // stored as a permit when no watcher is waiting yet
        self.ended.notify_one();
        if removed {
            debug!(scope = %self.scope, subscriber = %self.id, "subscription cancelled");
        }
        removed
    }
}

/// Stream of full snapshots for one scope.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<SnapshotItems>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Waits for the next snapshot; `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<SnapshotItems> {
        self.rx.recv().await
    }

    /// Drains the backlog without waiting and returns the newest snapshot.
    pub fn latest(&mut self) -> Option<SnapshotItems> {
        let mut latest = None;
        while let Ok(items) = self.rx.try_recv() {
            latest = Some(items);
        }
        latest
    }
}

impl Stream for Subscription {
    type Item = SnapshotItems;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
