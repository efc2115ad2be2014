//! In-process counter snapshot.

use axum::Json;
use axum::extract::State;
use blockwatch_core::metrics::CounterSnapshot;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    counters: CounterSnapshot,
    cache_entries: u64,
}

/// `GET /api/v1/metrics`
pub async fn counters(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.counters.snapshot(),
        cache_entries: state.queries.cache().entry_count(),
    })
}
