#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::Router;
use http_server::{LifecycleState, Server, ServerConfig, ServerError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

/// Signals off so tests never react to each other; a short deadline so a
/// broken drain fails fast instead of hanging the suite.
pub fn test_config() -> ServerConfig {
    ServerConfig::default()
        .with_trap_signals(false)
        .with_shutdown_timeout(Duration::from_secs(5))
}

pub struct ServerHandle {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub run: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    pub async fn start(config: ServerConfig) -> Self {
        Self::start_with(config, None, None, None).await
    }

    pub async fn start_with(
        config: ServerConfig,
        primary: Option<Router>,
        health: Option<Router>,
        debug: Option<Router>,
    ) -> Self {
        setup_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));

        let run = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .run_with_listener(listener, primary, health, debug)
                    .await
            }
        });
        wait_for_state(&server, LifecycleState::Serving).await;

        Self { server, addr, run }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn served_requests(&self) -> u64 {
        self.server.stats().unwrap().served_requests
    }

    pub fn open_connections(&self) -> i64 {
        self.server.stats().unwrap().open_connections
    }

    /// Shuts down and returns what `run` returned.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.server.shutdown().await;
        self.join().await
    }

    pub async fn join(self) -> Result<(), ServerError> {
        tokio::time::timeout(Duration::from_secs(10), self.run)
            .await
            .expect("run did not return")
            .expect("run panicked")
    }
}

pub async fn wait_for_state(server: &Server, state: LifecycleState) {
    wait_until(|| server.state() == state).await;
}

/// Polls `condition` every 10ms for up to 5 seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
