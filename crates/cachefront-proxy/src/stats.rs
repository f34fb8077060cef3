use crate::proxy::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use cachefront::{CacheFilterLoggingInfo, StoreStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// One-shot snapshot served on `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub active_entries: usize,
    pub upstream_tasks: usize,
    pub store: StoreStats,
    pub hit_rate: f64,
}

impl StatsSnapshot {
    fn collect(state: &AppState) -> Self {
        let store = state.store.stats();
        let total = store.hits + store.misses;
        StatsSnapshot {
            uptime_seconds: state.started.elapsed().as_secs(),
            active_entries: state.cache.as_ref().map_or(0, |c| c.active_entries()),
            upstream_tasks: state.tasks.len(),
            hit_rate: if total > 0 {
                store.hits as f64 / total as f64
            } else {
                0.0
            },
            store,
        }
    }
}

/// Count one finished request by its lookup and insert outcome.
pub fn record_outcome(info: &CacheFilterLoggingInfo) {
    metrics::counter!("cachefront_lookups_total", "status" => info.lookup_status.as_str())
        .increment(1);
    metrics::counter!("cachefront_inserts_total", "status" => info.insert_status.as_str())
        .increment(1);
}

/// Background task that refreshes the gauges every 500ms.
pub async fn gauge_refresher(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        let snapshot = StatsSnapshot::collect(&state);
        metrics::gauge!("cachefront_upstream_tasks").set(snapshot.upstream_tasks as f64);
        metrics::gauge!("cachefront_active_entries").set(snapshot.active_entries as f64);
        metrics::gauge!("cachefront_store_entries").set(snapshot.store.entries as f64);
    }
}

/// GET /api/stats
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatsSnapshot::collect(&state))
}
