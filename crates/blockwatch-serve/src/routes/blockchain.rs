//! Snapshot endpoints.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use blockwatch_core::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, MAX_NAME_LEN, Snapshot};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters for history.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    /// Rows to return (default: 100, range: 1..=1000).
    pub limit: Option<i64>,
}

/// Query parameters for a time range.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeQuery {
    /// Inclusive lower bound on ingestion time (RFC 3339).
    pub start: DateTime<Utc>,
    /// Inclusive upper bound on ingestion time (RFC 3339).
    pub end: DateTime<Utc>,
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn check_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "blockchain name must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn check_limit(limit: Option<i64>) -> Result<usize, ApiError> {
    match limit {
        None => Ok(DEFAULT_HISTORY_LIMIT),
        Some(n) if n >= 1 && n <= MAX_HISTORY_LIMIT as i64 => Ok(n as usize),
        Some(n) => Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}, got {n}"
        ))),
    }
}

/// `GET /api/v1/blockchain`
///
/// Every stored snapshot.
pub async fn list_all(State(state): State<AppState>) -> Result<Json<Vec<Snapshot>>, ApiError> {
    Ok(Json(state.queries.all().await?))
}

/// `GET /api/v1/blockchain/latest`
///
/// The most recent snapshot of each source.
pub async fn latest_all(State(state): State<AppState>) -> Result<Json<Vec<Snapshot>>, ApiError> {
    Ok(Json(state.queries.latest_all().await?))
}

/// `GET /api/v1/blockchain/{name}`
pub async fn latest(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    check_name(&name)?;

    state
        .queries
        .latest(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no data for blockchain '{name}'")))
}

/// `GET /api/v1/blockchain/{name}/history?limit=N`
pub async fn history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    check_name(&name)?;
    let params = query_params(query)?;
    let limit = check_limit(params.limit)?;

    Ok(Json(state.queries.history(&name, limit).await?))
}

/// `GET /api/v1/blockchain/range?start=..&end=..`
///
/// Snapshots of every source ingested within the range, newest first.
pub async fn range(
    State(state): State<AppState>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let RangeQuery { start, end } = query_params(query)?;
    if start > end {
        return Err(ApiError::BadRequest(format!(
            "start ({start}) must not be after end ({end})"
        )));
    }

    Ok(Json(state.queries.between(start, end)?))
}
