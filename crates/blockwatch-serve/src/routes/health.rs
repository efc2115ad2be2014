//! Health check endpoints.

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

/// Public health check endpoint.
///
/// Use this for load balancer health checks.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    status: &'static str,
    total_records: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedHealthResponse {
    #[serde(flatten)]
    health: HealthResponse,
    database: DatabaseHealth,
}

/// Health check that also reads the record count (through the cache).
pub async fn detailed_health(
    State(state): State<AppState>,
) -> Result<Json<DetailedHealthResponse>, ApiError> {
    let total_records = state.queries.total_records().await?;

    Ok(Json(DetailedHealthResponse {
        health: HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now(),
        },
        database: DatabaseHealth {
            status: "connected",
            total_records,
        },
    }))
}
