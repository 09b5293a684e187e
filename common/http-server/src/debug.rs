//! The `/debug/` surface: live counters, CPU profiles and the caller's own
//! debug handler.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, Request};
use axum::http::{header, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::{protos::Message, ProfilerGuardBuilder};
use serde::Deserialize;
use tower::{Service, ServiceExt};
use tracing::{info, warn};

use crate::stats::StatCounters;

pub const DEBUG_PREFIX: &str = "/debug/";
pub const VARS_PATH: &str = "/debug/vars";
pub const PPROF_PATH: &str = "/debug/pprof";

const PROFILES: &[(&str, &str)] = &[(
    "profile",
    "CPU profile, gzipped pprof protobuf. Length set by the seconds GET parameter",
)];

const DEFAULT_PROFILE_SECONDS: u64 = 30;
const DEFAULT_PROFILE_FREQUENCY: i32 = 100;

#[derive(Deserialize)]
struct ProfileParams {
    // how long to sample before building the report
    seconds: Option<u64>,
    // sample frequency in Hz
    frequency: Option<i32>,
}

/// Dispatches everything under [`DEBUG_PREFIX`]. Paths that are neither
/// counters nor profiles go to the caller's debug handler, or to `fallback`
/// when there is none.
#[derive(Clone)]
pub(crate) struct DebugRoutes<F> {
    stats: Arc<StatCounters>,
    handler: Option<Router>,
    fallback: F,
}

impl<F> DebugRoutes<F>
where
    F: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    F::Future: Send,
{
    pub(crate) fn new(stats: Arc<StatCounters>, handler: Option<Router>, fallback: F) -> Self {
        Self {
            stats,
            handler,
            fallback,
        }
    }

    pub(crate) async fn dispatch(self, request: Request) -> Response {
        let path = request.uri().path();

        if matches_prefix(path, VARS_PATH) {
            return Json(self.stats.snapshot()).into_response();
        }

        if matches_prefix(path, PPROF_PATH) {
            return match path[PPROF_PATH.len()..].trim_matches('/') {
                "" => Html(profile_index()).into_response(),
                "profile" => cpu_profile(request.uri()).await,
                _ => (StatusCode::NOT_FOUND, "Unknown profile").into_response(),
            };
        }

        match self.handler {
            Some(handler) => handler
                .oneshot(request)
                .await
                .unwrap_or_else(|never| match never {}),
            None => self
                .fallback
                .oneshot(request)
                .await
                .unwrap_or_else(|never| match never {}),
        }
    }
}

async fn cpu_profile(uri: &Uri) -> Response {
    let params = match Query::<ProfileParams>::try_from_uri(uri) {
        Ok(Query(params)) => params,
        Err(rejection) => return rejection.into_response(),
    };
    let seconds = params
        .seconds
        .filter(|&s| s > 0)
        .unwrap_or(DEFAULT_PROFILE_SECONDS);
    let frequency = params.frequency.unwrap_or(DEFAULT_PROFILE_FREQUENCY);

    info!(seconds, frequency, "collecting cpu profile");
    match generate_profile(frequency, seconds).await {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"profile\""),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to collect cpu profile");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

async fn generate_profile(frequency: i32, seconds: u64) -> Result<Vec<u8>> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to build profiler guard")?;

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let profile = guard
        .report()
        .build()
        .context("Failed to build profiler report")?
        .pprof()
        .context("Failed to build profiler profile")?;

    let mut body = Vec::new();
    let mut encoder = GzEncoder::new(&mut body, Compression::default());
    profile
        .write_to_writer(&mut encoder)
        .context("Failed to write profile")?;
    encoder.finish().context("Failed to finish encoding profile")?;

    Ok(body)
}

/// True for `prefix` itself and anything below it, but not for siblings that
/// merely share the prefix (`/debug/variables`).
fn matches_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn profile_index() -> String {
    let rows: String = PROFILES
        .iter()
        .map(|(name, description)| {
            format!(
                "<tr><td><a href=\"{PPROF_PATH}/{name}\">{name}</a></td><td>{description}</td></tr>\n"
            )
        })
        .collect();

    format!(
        "<html>\n<head><title>{PPROF_PATH}/</title></head>\n<body>\n{PPROF_PATH}/<br>\n<br>\n\
         Types of profiles available:\n<table>\n{rows}</table>\n\
         <a href=\"{VARS_PATH}\">vars</a>\n</body>\n</html>\n"
    )
}
