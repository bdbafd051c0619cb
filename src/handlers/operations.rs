//! Operation status and cancellation endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::info;
use uuid::Uuid;

use crate::{error::AppError, models::operation::Operation, server::AppState};

/// `GET /api/v1/operations/{id}`
///
/// Snapshot of one operation. Stream clients use it after `resyncRequired`.
///
/// # Errors
///
/// - 404 if the id is unknown or has been garbage-collected
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, AppError> {
    state
        .runner
        .operations()
        .get(id)
        .map(Json)
        .ok_or(AppError::OperationNotFound(id))
}

/// `POST /api/v1/operations/{id}/cancel`
///
/// # Errors
///
/// - 404 if the id is unknown
/// - 409 if the operation already finished or its kind cannot be cancelled
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, AppError> {
    let operation = state.runner.cancel(id)?;
    info!(operation_id = %id, status = %operation.status, "cancel requested over API");
    Ok(Json(operation))
}
