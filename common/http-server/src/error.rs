use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// No primary handler was supplied and the server was configured to require one.
    #[error("no handler")]
    NoHandler,

    /// `run` was called while a previous run of the same server is still going.
    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Draining did not finish before the deadline. Logged by the server, never
    /// returned from `run` or `shutdown`.
    #[error("shutdown timed out after {elapsed:?}, {remaining} connections still open")]
    ShutdownTimeout { elapsed: Duration, remaining: usize },

    /// The accept loop failed for a reason other than a deliberate shutdown.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
}
