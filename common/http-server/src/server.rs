use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::address;
use crate::config::ServerConfig;
use crate::connection::{Activity, ConnectionGuard, ConnectionId, ConnectionTracker, RequestGuard};
use crate::error::ServerError;
use crate::handlers;
use crate::lifecycle::{DrainTrigger, Lifecycle, LifecycleState};
use crate::shutdown::spawn_signal_watcher;
use crate::stats::{StatCounters, StatsSnapshot};

/// How long force-closed connections get to unwind once the deadline passed.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Where the accept loop gets its connections from.
pub(crate) trait Acceptor {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Acceptor for TcpListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// HTTP server with signal-triggered graceful shutdown and request/connection
/// accounting.
///
/// [`run`](Server::run) serves until a drain is triggered, either by SIGINT/SIGTERM
/// or by [`shutdown`](Server::shutdown), then stops accepting, waits for open
/// connections up to `shutdown_timeout` and force-closes whatever is left.
/// Each run gets fresh counters and a fresh lifecycle.
pub struct Server {
    config: ServerConfig,
    current: Mutex<Option<Arc<RunningServer>>>,
}

/// State of one run; lives from the start of `run` until it returns.
struct RunningServer {
    lifecycle: Arc<Lifecycle>,
    stats: Arc<StatCounters>,
    local_addr: OnceLock<SocketAddr>,
}

/// Marks the run stopped however `run` exits, including when its future is dropped.
struct StopGuard(Arc<Lifecycle>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Resolves the bind address, binds it and serves until shut down.
    ///
    /// Returns `Ok(())` after a deliberate shutdown, even if draining hit the
    /// deadline. Bind failures and transport faults are returned as errors.
    pub async fn run(
        &self,
        primary: Option<Router>,
        health: Option<Router>,
        debug: Option<Router>,
    ) -> Result<(), ServerError> {
        self.check_handler(&primary)?;
        let running = self.begin_run()?;
        let _stop = StopGuard(running.lifecycle.clone());

        let address = address::resolve(&self.config.address);
        let listener = match TcpListener::bind(address::to_bind_target(&address)).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(%address, error = %source, "failed to bind server address");
                return Err(ServerError::Bind { address, source });
            }
        };

        self.serve(&running, listener, primary, health, debug).await
    }

    /// Same as [`run`](Server::run), on a listener the caller already bound.
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        primary: Option<Router>,
        health: Option<Router>,
        debug: Option<Router>,
    ) -> Result<(), ServerError> {
        self.run_with_acceptor(listener, primary, health, debug).await
    }

    pub(crate) async fn run_with_acceptor<A: Acceptor>(
        &self,
        acceptor: A,
        primary: Option<Router>,
        health: Option<Router>,
        debug: Option<Router>,
    ) -> Result<(), ServerError> {
        self.check_handler(&primary)?;
        let running = self.begin_run()?;
        let _stop = StopGuard(running.lifecycle.clone());

        self.serve(&running, acceptor, primary, health, debug).await
    }

    /// Drains the current run and waits until it has stopped. Only the first
    /// trigger (this call or a signal) starts a drain; later ones just wait.
    /// Does nothing when no run is in progress.
    pub async fn shutdown(&self) {
        let Some(running) = self.current() else {
            debug!("shutdown requested but the server is not running");
            return;
        };

        running.lifecycle.begin_drain(DrainTrigger::Explicit);
        running.lifecycle.wait_stopped().await;
    }

    /// State of the current (or most recent) run; `Idle` before the first one.
    pub fn state(&self) -> LifecycleState {
        self.current()
            .map(|running| running.lifecycle.state())
            .unwrap_or(LifecycleState::Idle)
    }

    /// Address the current run is listening on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current()
            .and_then(|running| running.local_addr.get().copied())
    }

    /// Counters of the current (or most recent) run.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.current().map(|running| running.stats.snapshot())
    }

    fn current(&self) -> Option<Arc<RunningServer>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_handler(&self, primary: &Option<Router>) -> Result<(), ServerError> {
        if self.config.require_handler && primary.is_none() {
            error!("no primary handler supplied");
            return Err(ServerError::NoHandler);
        }
        Ok(())
    }

    fn begin_run(&self) -> Result<Arc<RunningServer>, ServerError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = current.as_ref() {
            if running.lifecycle.state() != LifecycleState::Stopped {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let running = Arc::new(RunningServer {
            lifecycle: Arc::new(Lifecycle::new()),
            stats: Arc::new(StatCounters::new()),
            local_addr: OnceLock::new(),
        });
        *current = Some(running.clone());
        Ok(running)
    }

    async fn serve<A: Acceptor>(
        &self,
        running: &RunningServer,
        listener: A,
        primary: Option<Router>,
        health: Option<Router>,
        debug: Option<Router>,
    ) -> Result<(), ServerError> {
        let lifecycle = &running.lifecycle;
        let app = handlers::compose(
            primary,
            health,
            debug,
            self.config.debug,
            running.stats.clone(),
        );

        let local_addr = listener.local_addr().map_err(ServerError::Transport)?;
        // set once per run, cannot already be filled
        let _ = running.local_addr.set(local_addr);
        info!(address = %local_addr, debug = self.config.debug, "starting server");

        lifecycle.mark_serving();
        let watcher = self
            .config
            .trap_signals
            .then(|| spawn_signal_watcher(lifecycle.clone()));

        let ctx = ConnectionContext {
            builder: AutoBuilder::new(TokioExecutor::new()),
            app,
            tracker: ConnectionTracker::new(running.stats.clone()),
            connections: TaskTracker::new(),
            drain: lifecycle.drain_token(),
            force_close: CancellationToken::new(),
            idle_timeout: self.config.idle_timeout,
        };
        let mut next_id: ConnectionId = 0;
        let mut backoff: Option<Duration> = None;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = lifecycle.drain_requested() => break Ok(()),

                accepted = listener.accept() => match accepted {
                    Ok((socket, remote_addr)) => {
                        backoff = None;
                        next_id += 1;
                        ctx.spawn(next_id, socket, remote_addr);
                    }
                    Err(e) if is_transient(&e) => {
                        let delay = backoff
                            .map(|d| (d * 2).min(ACCEPT_BACKOFF_MAX))
                            .unwrap_or(ACCEPT_BACKOFF_START);
                        backoff = Some(delay);
                        warn!(error = %e, retry_in = ?delay, "failed to accept connection");

                        tokio::select! {
                            _ = lifecycle.drain_requested() => break Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "accept loop failed");
                        break Err(ServerError::Transport(e));
                    }
                },
            }
        };

        // No new connections from here on
        drop(listener);
        if outcome.is_err() {
            lifecycle.begin_drain(DrainTrigger::TransportFailure);
        }
        lifecycle.mark_draining();

        self.drain(&ctx).await;

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        lifecycle.mark_stopped();
        info!(stats = ?running.stats.snapshot(), "server stopped");

        outcome
    }

    /// Waits for open connections, bounded by `shutdown_timeout`. Past the
    /// deadline the remaining connections are dropped and the timeout is
    /// logged, not returned.
    async fn drain(&self, ctx: &ConnectionContext) {
        let connections = &ctx.connections;
        connections.close();
        let started = Instant::now();
        info!(
            open_connections = connections.len(),
            timeout = ?self.config.shutdown_timeout,
            "draining connections"
        );

        if tokio::time::timeout(self.config.shutdown_timeout, connections.wait())
            .await
            .is_ok()
        {
            info!(elapsed = ?started.elapsed(), "server drained");
            return;
        }

        let err = ServerError::ShutdownTimeout {
            elapsed: started.elapsed(),
            remaining: connections.len(),
        };
        warn!(error = %err, "timeout shutting down server, forcing connections closed");
        ctx.force_close.cancel();

        if tokio::time::timeout(FORCE_CLOSE_GRACE, connections.wait())
            .await
            .is_err()
        {
            error!(
                remaining = connections.len(),
                "connections still open after force close"
            );
        }
    }
}

/// Everything a connection task needs, shared by the accept loop.
struct ConnectionContext {
    builder: AutoBuilder<TokioExecutor>,
    app: Router,
    tracker: ConnectionTracker,
    connections: TaskTracker,
    drain: CancellationToken,
    force_close: CancellationToken,
    idle_timeout: Duration,
}

impl ConnectionContext {
    fn spawn(&self, id: ConnectionId, socket: TcpStream, remote_addr: SocketAddr) {
        let guard = ConnectionGuard::open(id, self.tracker.clone());

        // Match axum default: set TCP_NODELAY for low-latency
        if let Err(e) = socket.set_nodelay(true) {
            warn!(connection = id, error = %e, "failed to set TCP_NODELAY");
        }

        let activity = Arc::new(Activity::new());
        let service = {
            let app = self.app.clone();
            let activity = activity.clone();
            hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                let in_flight = RequestGuard::start(activity.clone());
                let mut request = request.map(axum::body::Body::new);
                request.extensions_mut().insert(ConnectInfo(remote_addr));

                // The handler runs on its own task: closing the connection only
                // drops the response, the handler itself always completes.
                let handler = tokio::spawn(app.clone().oneshot(request));
                async move {
                    let response = finish_request(id, handler.await);
                    drop(in_flight);
                    Ok::<_, Infallible>(response)
                }
            })
        };

        let conn = self
            .builder
            .serve_connection_with_upgrades(TokioIo::new(socket), service)
            .into_owned();

        let drain = self.drain.clone();
        let force_close = self.force_close.clone();
        let idle_timeout = self.idle_timeout;

        self.connections.spawn(async move {
            let _guard = guard;
            let mut conn = std::pin::pin!(conn);
            let mut closing = false;

            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(connection = id, error = %e, "connection closed with error");
                        }
                        break;
                    }
                    _ = drain.cancelled(), if !closing => {
                        conn.as_mut().graceful_shutdown();
                        closing = true;
                    }
                    _ = activity.idle_for(idle_timeout), if !closing => {
                        debug!(connection = id, "closing idle connection");
                        conn.as_mut().graceful_shutdown();
                        closing = true;
                    }
                    _ = force_close.cancelled() => {
                        debug!(connection = id, "force closing connection");
                        break;
                    }
                }
            }
        });
    }
}

fn finish_request(
    id: ConnectionId,
    joined: Result<Result<Response, Infallible>, tokio::task::JoinError>,
) -> Response {
    match joined {
        Ok(Ok(response)) => response,
        Ok(Err(never)) => match never {},
        Err(e) => {
            error!(connection = id, error = %e, "request handler failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Accept errors worth retrying: the peer went away before we accepted, or
/// the process ran out of file descriptors for a moment.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails once with a retryable error, then with a fatal one.
    struct BrokenAcceptor {
        calls: AtomicUsize,
    }

    impl Acceptor for BrokenAcceptor {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }

        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(io::Error::from(io::ErrorKind::ConnectionAborted))
            } else {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
        }
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[test]
    fn idle_before_first_run() {
        let server = Server::new(ServerConfig::default());
        assert_eq!(server.state(), LifecycleState::Idle);
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.stats(), None);
    }

    #[tokio::test]
    async fn shutdown_without_run_is_a_noop() {
        let server = Server::new(ServerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), server.shutdown())
            .await
            .expect("shutdown blocked without a running server");
        assert_eq!(server.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn missing_handler_rejected_when_required() {
        let server = Server::new(ServerConfig::default().with_require_handler(true));
        let result = server.run(None, None, None).await;
        assert!(matches!(result, Err(ServerError::NoHandler)));
        assert_eq!(server.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn fatal_accept_error_stops_the_run() {
        let server = Server::new(ServerConfig::default().with_trap_signals(false));
        let acceptor = BrokenAcceptor {
            calls: AtomicUsize::new(0),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run_with_acceptor(acceptor, None, None, None),
        )
        .await
        .expect("run did not return after a fatal accept error");

        match result {
            Err(ServerError::Transport(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("expected a transport error, got {other:?}"),
        }
        assert_eq!(server.state(), LifecycleState::Stopped);

        // The failed run is over, so shutdown has nothing to wait for
        tokio::time::timeout(Duration::from_secs(1), server.shutdown())
            .await
            .expect("shutdown blocked after the run failed");
    }
}
