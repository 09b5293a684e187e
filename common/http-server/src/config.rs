use std::time::Duration;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for [`Server`](crate::Server). Fixed once a run starts.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind; empty means resolve from `PORT` (see [`crate::address`]).
    pub address: String,
    /// Registers the `/debug/` routes.
    pub debug: bool,
    /// Upper bound on draining, measured from the drain trigger.
    pub shutdown_timeout: Duration,
    /// Kept-alive connections with no activity for this long are closed.
    pub idle_timeout: Duration,
    /// Drain on SIGINT/SIGTERM.
    pub trap_signals: bool,
    /// Fail the run with [`ServerError::NoHandler`](crate::ServerError::NoHandler)
    /// instead of falling back to the not-found responder.
    pub require_handler: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            debug: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            trap_signals: true,
            require_handler: false,
        }
    }
}

impl ServerConfig {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.trap_signals = trap_signals;
        self
    }

    pub fn with_require_handler(mut self, require_handler: bool) -> Self {
        self.require_handler = require_handler;
        self
    }
}
