//! Health check endpoint for service monitoring.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{server::AppState, storage::PoolMetrics};

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,

    /// Storage backend name (`postgres`, `memory`)
    pub backend: &'static str,

    /// Connection pool snapshot
    pub pool: PoolMetrics,

    /// Operations currently held in memory
    pub operations: usize,

    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health check handler. Unauthenticated and never touches the database.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "backend": "postgres",
///   "pool": { "size": 3, "max_size": 10, "active": 1, "idle": 2, ... },
///   "operations": 4,
///   "timestamp": "2025-12-21T19:00:00Z"
/// }
/// ```
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        backend: state.backend_name,
        pool: state.pool.metrics(),
        operations: state.runner.operations().len(),
        timestamp: Utc::now(),
    })
}
