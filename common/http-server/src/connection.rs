//! Per-connection lifecycle events and the tracker that turns them into
//! open-connection counts.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::stats::StatCounters;

/// Identifies one accepted connection for the lifetime of a run.
pub type ConnectionId = u64;

/// Transitions a connection reports over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted; reported exactly once.
    New,
    /// Fully closed; reported exactly once.
    Closed,
}

/// Forwards connection transitions to the open-connection counter.
///
/// The transport reports exactly one `New` and one `Closed` per connection;
/// the tracker does not deduplicate.
#[derive(Clone)]
pub struct ConnectionTracker {
    stats: Arc<StatCounters>,
}

impl ConnectionTracker {
    pub fn new(stats: Arc<StatCounters>) -> Self {
        Self { stats }
    }

    pub fn on_transition(&self, id: ConnectionId, state: ConnState) {
        debug!(connection = id, ?state, "connection state changed");
        match state {
            ConnState::New => self.stats.increment_open(),
            ConnState::Closed => self.stats.decrement_open(),
        }
    }
}

/// Reports `New` when created and `Closed` when dropped, so a connection task
/// that is aborted or force-closed still balances the count.
pub(crate) struct ConnectionGuard {
    id: ConnectionId,
    tracker: ConnectionTracker,
}

impl ConnectionGuard {
    pub(crate) fn open(id: ConnectionId, tracker: ConnectionTracker) -> Self {
        tracker.on_transition(id, ConnState::New);
        Self { id, tracker }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.on_transition(self.id, ConnState::Closed);
    }
}

/// Request activity on a single connection, for the idle timeout.
pub(crate) struct Activity {
    started: Instant,
    last_active_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn request_finished(&self) {
        self.touch();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_active_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.started + Duration::from_millis(self.last_active_ms.load(Ordering::SeqCst)) + timeout
    }

    /// Resolves once the connection has had no request in flight and no
    /// activity for `timeout`.
    pub(crate) async fn idle_for(&self, timeout: Duration) {
        let mut deadline = self.idle_deadline(timeout);
        loop {
            tokio::time::sleep_until(deadline).await;

            if self.in_flight.load(Ordering::SeqCst) > 0 {
                deadline = Instant::now() + timeout;
                continue;
            }

            let latest = self.idle_deadline(timeout);
            if latest <= Instant::now() {
                return;
            }
            deadline = latest;
        }
    }
}

/// Marks a request finished when dropped, including when the request future
/// is cancelled by a force-close.
pub(crate) struct RequestGuard {
    activity: Arc<Activity>,
}

impl RequestGuard {
    pub(crate) fn start(activity: Arc<Activity>) -> Self {
        activity.request_started();
        Self { activity }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.activity.request_finished();
    }
}
