use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

const SERVED_REQUESTS_METRIC: &str = "http_server_requests_served_total";
const OPEN_CONNECTIONS_METRIC: &str = "http_server_open_connections";

/// Request and connection counters for one running server.
///
/// Each run owns its own instance and hands an `Arc` of it to the dispatch
/// table (served requests) and the connection tracker (open connections), so
/// several servers in one process never share counts. Updates are mirrored to
/// the `metrics` facade for whatever recorder the embedding service installs.
#[derive(Debug, Default)]
pub struct StatCounters {
    served_requests: AtomicU64,
    open_connections: AtomicI64,
}

/// Point-in-time view of [`StatCounters`], as exposed on `/debug/vars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub served_requests: u64,
    pub open_connections: i64,
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_served(&self) {
        self.served_requests.fetch_add(1, Ordering::SeqCst);
        metrics::counter!(SERVED_REQUESTS_METRIC).increment(1);
    }

    pub fn increment_open(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!(OPEN_CONNECTIONS_METRIC).increment(1.0);
    }

    pub fn decrement_open(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!(OPEN_CONNECTIONS_METRIC).decrement(1.0);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            served_requests: self.served_requests.load(Ordering::SeqCst),
            open_connections: self.open_connections.load(Ordering::SeqCst),
        }
    }
}
