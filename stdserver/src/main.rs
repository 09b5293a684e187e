use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use http_server::Server;

mod config;

use config::Config;

fn app() -> Router {
    Router::new()
        .route("/hello/world", get(|| async { "Hello World!\n" }))
        .route("/hello", get(|| async { "Hello, Unknown!\n" }))
        .route("/wait/:secs", get(wait))
        .fallback(|| async { "Hello, Stranger!\n" })
}

/// Holds the request open, handy for watching a drain hit its deadline.
async fn wait(Path(secs): Path<u64>) -> String {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    format!("Waited {secs}s\n")
}

fn health() -> Router {
    Router::new().fallback(|| async { "Everything Ok\n" })
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let server = Server::new(config.to_server_config());
    if let Err(err) = server.run(Some(app()), Some(health()), None).await {
        tracing::error!("server exited: {}", err);
        std::process::exit(1);
    }
}
