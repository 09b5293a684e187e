//! HTTP server lifecycle for Rust services
//!
//! Wraps an axum [`Router`](axum::Router) with:
//!
//! - **Graceful shutdown**: SIGINT/SIGTERM or [`Server::shutdown`] stop the
//!   accept loop, let in-flight requests finish and force-close whatever is
//!   still open once `shutdown_timeout` has passed
//! - **Accounting**: served requests and open connections, kept per run in
//!   [`StatCounters`]
//! - **Debug endpoints**: `/debug/vars` and `/debug/pprof/` when debug mode is on
//!
//! # Examples
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use http_server::{Server, ServerConfig};
//!
//! # async fn example() -> Result<(), http_server::ServerError> {
//! let app = Router::new().route("/hello", get(|| async { "Hello World!" }));
//!
//! let server = Server::new(ServerConfig::default().with_debug(true));
//! // Blocks until a signal arrives and the server has drained
//! server.run(Some(app), None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
mod config;
pub mod connection;
mod debug;
mod error;
pub mod handlers;
mod lifecycle;
mod server;
pub mod shutdown;
mod stats;

pub use config::{ServerConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT};
pub use connection::{ConnState, ConnectionId, ConnectionTracker};
pub use debug::{DEBUG_PREFIX, PPROF_PATH, VARS_PATH};
pub use error::ServerError;
pub use handlers::{compose, HEALTH_PATH, HEALTHY_BODY, NOT_FOUND_BODY};
pub use lifecycle::{DrainTrigger, LifecycleState};
pub use server::Server;
pub use shutdown::termination_signal;
pub use stats::{StatCounters, StatsSnapshot};
