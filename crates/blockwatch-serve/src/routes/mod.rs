//! API route definitions.

mod blockchain;
mod health;
mod metrics;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /health/detailed` - Health check with record count
///
/// ### Blockchain
/// - `GET /api/v1/blockchain` - All snapshots
/// - `GET /api/v1/blockchain/latest` - Latest snapshot per source
/// - `GET /api/v1/blockchain/range` - Snapshots ingested in a time range (`?start=&end=`)
/// - `GET /api/v1/blockchain/{name}` - Latest snapshot for one source
/// - `GET /api/v1/blockchain/{name}/history` - Newest-first history (`?limit=`)
///
/// ### Metrics
/// - `GET /api/v1/metrics` - In-process counters as JSON
pub fn router(state: AppState) -> Router {
    let health = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/detailed", get(health::detailed_health));

    let api_v1 = Router::new()
        .route("/blockchain", get(blockchain::list_all))
        .route("/blockchain/latest", get(blockchain::latest_all))
        .route("/blockchain/range", get(blockchain::range))
        .route("/blockchain/{name}", get(blockchain::latest))
        .route("/blockchain/{name}/history", get(blockchain::history))
        .route("/metrics", get(metrics::counters));

    Router::new()
        .merge(health)
        .nest("/api/v1", api_v1)
        .with_state(state)
}
