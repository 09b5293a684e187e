//! Lifecycle state of a single run and the one-shot drain latch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Serving,
    Draining,
    Stopped,
}

/// What asked the server to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Signal(&'static str),
    Explicit,
    TransportFailure,
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainTrigger::Signal(name) => write!(f, "signal {name}"),
            DrainTrigger::Explicit => write!(f, "explicit shutdown call"),
            DrainTrigger::TransportFailure => write!(f, "transport failure"),
        }
    }
}

/// Shared by the accept loop, the signal watcher and `Server::shutdown`.
///
/// Only the first [`begin_drain`](Lifecycle::begin_drain) call starts a drain;
/// later calls, from any trigger, are no-ops.
pub(crate) struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    drain: CancellationToken,
    drain_started: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            state,
            drain: CancellationToken::new(),
            drain_started: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn mark_serving(&self) {
        self.transition(LifecycleState::Idle, LifecycleState::Serving);
    }

    pub(crate) fn mark_draining(&self) {
        self.transition(LifecycleState::Serving, LifecycleState::Draining);
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Stopped {
                return false;
            }
            debug!(from = ?state, "lifecycle: stopped");
            *state = LifecycleState::Stopped;
            true
        });
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            debug!(?from, ?to, "lifecycle: transition");
            *state = to;
            true
        });
    }

    /// Returns true if this call started the drain.
    pub(crate) fn begin_drain(&self, trigger: DrainTrigger) -> bool {
        if self.drain_started.swap(true, Ordering::SeqCst) {
            debug!(%trigger, "drain already in progress, ignoring trigger");
            return false;
        }

        info!(%trigger, "shutting down server");
        self.mark_draining();
        self.drain.cancel();
        true
    }

    /// Resolves once a drain has been requested.
    pub(crate) fn drain_requested(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }

    pub(crate) fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let stopped = rx
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await
            .map(|_| ());
        if let Err(e) = stopped {
            debug!(error = %e, "lifecycle state channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn starts_idle() {
        assert_eq!(Lifecycle::new().state(), LifecycleState::Idle);
    }

    #[test]
    fn full_transition_sequence() {
        let lifecycle = Lifecycle::new();

        lifecycle.mark_serving();
        assert_eq!(lifecycle.state(), LifecycleState::Serving);

        assert!(lifecycle.begin_drain(DrainTrigger::Explicit));
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        assert!(lifecycle.drain_token().is_cancelled());

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        // Stopped is terminal
        lifecycle.mark_serving();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn second_trigger_is_a_noop() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_serving();

        assert!(lifecycle.begin_drain(DrainTrigger::Signal("SIGTERM")));
        assert!(!lifecycle.begin_drain(DrainTrigger::Explicit));
        assert!(!lifecycle.begin_drain(DrainTrigger::Signal("SIGINT")));
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
    }

    #[test]
    fn drain_before_serving_keeps_state() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_drain(DrainTrigger::Explicit));
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
        assert!(lifecycle.drain_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_start_exactly_one_drain() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.mark_serving();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let lifecycle = lifecycle.clone();
            tasks.push(tokio::spawn(async move {
                let trigger = if i % 2 == 0 {
                    DrainTrigger::Explicit
                } else {
                    DrainTrigger::Signal("SIGTERM")
                };
                lifecycle.begin_drain(trigger)
            }));
        }

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn wait_stopped_resolves_on_stop() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.wait_stopped().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lifecycle.mark_stopped();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_stopped_returns_at_once_when_already_stopped() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_stopped();

        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_stopped())
            .await
            .expect("already stopped");
    }

    #[test]
    fn trigger_display() {
        assert_eq!(
            DrainTrigger::Signal("SIGINT").to_string(),
            "signal SIGINT"
        );
        assert_eq!(DrainTrigger::Explicit.to_string(), "explicit shutdown call");
    }
}
