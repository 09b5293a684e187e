use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower::{service_fn, Layer, ServiceExt};

use crate::debug::{DebugRoutes, DEBUG_PREFIX};
use crate::stats::StatCounters;

pub const HEALTH_PATH: &str = "/healthz";
pub const NOT_FOUND_BODY: &str = "Nothing here.";
pub const HEALTHY_BODY: &str = "up and running.";

/// Answers every request with 404 and [`NOT_FOUND_BODY`]; used when no
/// primary handler is supplied.
pub fn not_found_handler() -> Router {
    Router::new().fallback(not_found)
}

/// Answers every request with 200 and [`HEALTHY_BODY`]; used when no health
/// handler is supplied.
pub fn health_handler() -> Router {
    Router::new().fallback(healthy)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

async fn healthy() -> &'static str {
    HEALTHY_BODY
}

/// Counts the request as served before the wrapped handler runs, so a handler
/// that never completes is still counted.
async fn count_served(
    State(stats): State<Arc<StatCounters>>,
    request: Request,
    next: Next,
) -> Response {
    stats.increment_served();
    next.run(request).await
}

/// Builds the dispatch table for one run.
///
/// - `/healthz` goes to `health` (or [`health_handler`]) and is not counted.
/// - With `debug_mode`, everything under `/debug/` goes to the debug surface:
///   `/debug/vars` (live counters as JSON), `/debug/pprof/` (profile index) and
///   anything else to `debug` when supplied.
/// - Every other path goes to `primary` (or [`not_found_handler`]), counted.
///
/// Handlers see the full request path.
pub fn compose(
    primary: Option<Router>,
    health: Option<Router>,
    debug: Option<Router>,
    debug_mode: bool,
    stats: Arc<StatCounters>,
) -> Router {
    let primary = primary.unwrap_or_else(not_found_handler);
    let health = health.unwrap_or_else(health_handler);

    let counted = middleware::from_fn_with_state(stats.clone(), count_served).layer(primary);

    // route_service refuses a bare Router, so forward through a service_fn
    let health = service_fn(move |request: Request| health.clone().oneshot(request));
    let mut router = Router::new().route_service(HEALTH_PATH, health);

    if debug_mode {
        let routes = DebugRoutes::new(stats, debug, counted.clone());
        let routes = service_fn(move |request: Request| {
            let routes = routes.clone();
            async move { Ok::<_, Infallible>(routes.dispatch(request).await) }
        });
        router = router
            .route_service(DEBUG_PREFIX, routes.clone())
            .route_service(&format!("{DEBUG_PREFIX}*path"), routes);
    }

    router.fallback_service(counted)
}
