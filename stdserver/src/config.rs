use std::time::Duration;

use envconfig::Envconfig;
use http_server::ServerConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Empty means ":$PORT", or ":8080" when PORT is unset too.
    #[envconfig(from = "ADDRESS", default = "")]
    pub address: String,

    #[envconfig(from = "DEBUG", default = "true")]
    pub debug: bool,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "IDLE_TIMEOUT_SECS", default = "60")]
    pub idle_timeout_secs: u64,

    #[envconfig(from = "REQUIRE_HANDLER", default = "false")]
    pub require_handler: bool,
}

impl Config {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_address(self.address.clone())
            .with_debug(self.debug)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_require_handler(self.require_handler)
    }
}
