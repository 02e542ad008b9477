//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track every accepted connection as either active or idle
//! - Generate unique connection IDs for tracing
//! - Bound the idle set and retire idle connections past their timeout
//! - Force-close everything when the drain window elapses
//!
//! # State Machine
//! ```text
//! register ──→ Active ⇄ Idle
//!                 │        │
//!        hijack / close / sweep / overflow
//!                 ↓        ↓
//!              (untracked)
//! ```
//! A tracked connection lives in exactly one of the two sets. Leaving the
//! tracker takes one of two signals. Idle overflow and the sweep *retire* a
//! connection: its task shuts HTTP down gracefully, so a response whose last
//! bytes are still buffered gets flushed first. `close_all` *closes* it: the
//! task drops the socket at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which set a tracked connection currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Serving at least one request.
    Active,
    /// Open with no request in flight.
    Idle,
}

/// Wake-ups a connection task listens for.
#[derive(Debug, Default)]
struct Signals {
    retire: Notify,
    close: Notify,
}

#[derive(Debug, Clone)]
struct ConnectionHandle {
    peer: SocketAddr,
    signals: Arc<Signals>,
}

#[derive(Debug)]
struct IdleEntry {
    handle: ConnectionHandle,
    since: Instant,
}

#[derive(Debug, Default)]
struct Sets {
    active: HashMap<ConnectionId, ConnectionHandle>,
    idle: HashMap<ConnectionId, IdleEntry>,
}

#[derive(Debug)]
struct TrackerInner {
    listener: String,
    sets: Mutex<Sets>,
    total: watch::Sender<usize>,
    max_idle: usize,
    idle_timeout: Duration,
}

/// Tracks the connections of one listener.
///
/// Cheap to clone; all clones share the same sets.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Create a tracker for the listener named `listener`.
    pub fn new(listener: impl Into<String>, max_idle: usize, idle_timeout: Duration) -> Self {
        let (total, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                listener: listener.into(),
                sets: Mutex::new(Sets::default()),
                total,
                max_idle,
                idle_timeout,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sets> {
        self.inner.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, sets: &Sets) {
        let (active, idle) = (sets.active.len(), sets.idle.len());
        self.inner.total.send_replace(active + idle);
        metrics::set_connections(&self.inner.listener, active, idle);
    }

    /// Start tracking a freshly accepted connection; it begins active.
    ///
    /// The returned guard untracks the connection when dropped.
    pub fn register(&self, peer: SocketAddr) -> TrackedConnection {
        let id = ConnectionId::new();
        let signals = Arc::new(Signals::default());
        {
            let mut sets = self.lock();
            sets.active.insert(
                id,
                ConnectionHandle {
                    peer,
                    signals: Arc::clone(&signals),
                },
            );
            self.publish(&sets);
        }
        tracing::trace!(connection_id = %id, peer_addr = %peer, "Connection tracked");

        TrackedConnection {
            activity: Arc::new(ConnectionActivity {
                id,
                in_flight: AtomicUsize::new(0),
                tracker: self.clone(),
                signals,
            }),
        }
    }

    /// Move a connection into the active set.
    pub fn mark_active(&self, id: ConnectionId) {
        let mut sets = self.lock();
        if let Some(entry) = sets.idle.remove(&id) {
            sets.active.insert(id, entry.handle);
            self.publish(&sets);
        }
    }

    /// Move a connection into the idle set, retiring it instead when the
    /// idle set is already full. Returns false when the connection was retired.
    pub fn mark_idle(&self, id: ConnectionId) -> bool {
        let mut sets = self.lock();
        let Some(handle) = sets.active.remove(&id) else {
            return sets.idle.contains_key(&id);
        };

        let kept = sets.idle.len() < self.inner.max_idle;
        if kept {
            sets.idle.insert(
                id,
                IdleEntry {
                    handle,
                    since: Instant::now(),
                },
            );
        } else {
            tracing::debug!(
                connection_id = %id,
                peer_addr = %handle.peer,
                max_idle = self.inner.max_idle,
                "Idle limit reached, retiring connection"
            );
            handle.signals.retire.notify_one();
        }
        self.publish(&sets);
        kept
    }

    /// Stop tracking a connection that switched protocols.
    pub fn hijack(&self, id: ConnectionId) {
        tracing::debug!(connection_id = %id, "Connection hijacked, no longer tracked");
        self.remove(id);
    }

    fn remove(&self, id: ConnectionId) {
        let mut sets = self.lock();
        let removed = sets.active.remove(&id).is_some() || sets.idle.remove(&id).is_some();
        if removed {
            self.publish(&sets);
        }
    }

    /// Retire idle connections that have been idle longer than the timeout,
    /// measured at `now`. Returns the number retired.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let timeout = self.inner.idle_timeout;
        let mut sets = self.lock();
        let expired: Vec<ConnectionId> = sets
            .idle
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.since) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = sets.idle.remove(id) {
                entry.handle.signals.retire.notify_one();
            }
        }
        if !expired.is_empty() {
            self.publish(&sets);
            tracing::debug!(
                listener = %self.inner.listener,
                retired = expired.len(),
                "Swept idle connections"
            );
        }
        expired.len()
    }

    /// Retire idle connections past the timeout.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Sweep on `interval` until `stop` flips to true.
    pub async fn run_sweeper(self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_idle();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Force-close every tracked connection. Returns the number closed.
    pub fn close_all(&self) -> usize {
        let mut sets = self.lock();
        let mut closed = 0;
        for (_, handle) in sets.active.drain() {
            handle.signals.close.notify_one();
            closed += 1;
        }
        for (_, entry) in sets.idle.drain() {
            entry.handle.signals.close.notify_one();
            closed += 1;
        }
        self.publish(&sets);
        closed
    }

    /// Total tracked connections.
    pub fn len(&self) -> usize {
        *self.inner.total.borrow()
    }

    /// True when no connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections currently serving a request.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Connections currently idle.
    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Current state of a connection, or `None` when untracked.
    pub fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        let sets = self.lock();
        if sets.active.contains_key(&id) {
            Some(ConnectionState::Active)
        } else if sets.idle.contains_key(&id) {
            Some(ConnectionState::Idle)
        } else {
            None
        }
    }

    /// Resolve once no connection is tracked.
    pub async fn wait_until_empty(&self) {
        let mut total = self.inner.total.subscribe();
        let _ = total.wait_for(|n| *n == 0).await;
    }
}

/// Per-connection shared state: in-flight request count and tracker signals.
#[derive(Debug)]
pub struct ConnectionActivity {
    id: ConnectionId,
    in_flight: AtomicUsize,
    tracker: ConnectionTracker,
    signals: Arc<Signals>,
}

impl ConnectionActivity {
    /// Note the start of a request; the first in-flight request marks the
    /// connection active.
    pub fn begin_request(self: &Arc<Self>) -> InFlightRequest {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            self.tracker.mark_active(self.id);
        }
        InFlightRequest {
            activity: Arc::clone(self),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Held until a response body is fully written or dropped.
#[derive(Debug)]
pub struct InFlightRequest {
    activity: Arc<ConnectionActivity>,
}

impl InFlightRequest {
    /// The connection is switching protocols and leaves the tracker.
    pub fn hijack(&self) {
        self.activity.tracker.hijack(self.activity.id);
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if self.activity.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.activity.tracker.mark_idle(self.activity.id);
        }
    }
}

/// Guard owned by the connection task; untracks the connection on drop.
#[derive(Debug)]
pub struct TrackedConnection {
    activity: Arc<ConnectionActivity>,
}

impl TrackedConnection {
    pub fn id(&self) -> ConnectionId {
        self.activity.id
    }

    pub fn activity(&self) -> Arc<ConnectionActivity> {
        Arc::clone(&self.activity)
    }

    /// Resolve when the tracker wants this connection wound down gracefully.
    pub async fn retired(&self) {
        self.activity.signals.retire.notified().await;
    }

    /// Resolve when the tracker wants this connection dropped now.
    pub async fn closed(&self) {
        self.activity.signals.close.notified().await;
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.activity.tracker.remove(self.activity.id);
        tracing::trace!(connection_id = %self.activity.id, "Connection closed");
    }
}
