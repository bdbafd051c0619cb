//! Long-running command endpoints.
//!
//! Each `POST /api/v1/<kind>` validates the body, starts a worker and answers
//! `202 Accepted` with the operation id. Progress is followed on the stream
//! endpoint and the final state on `GET /api/v1/operations/{id}`.

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use tracing::info;

use crate::{
    error::AppError,
    models::{
        command::{AcceptedResponse, CommandRequest, ValidationErrors},
        operation::CommandKind,
    },
    server::AppState,
    services::authenticator::AuthContext,
};

fn accept(
    state: &AppState,
    auth: &AuthContext,
    kind: CommandKind,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let Json(request) =
        body.map_err(|rejection| AppError::Validation(ValidationErrors::single("body", rejection.body_text())))?;

    let operation_id = state.runner.submit(kind, request)?;
    info!(%operation_id, %kind, key_id = %auth.key_id, "command accepted");

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { operation_id })))
}

/// `POST /api/v1/scan`
///
/// # Request Body
///
/// ```json
/// { "tenantId": "acme-prod", "params": { "regions": ["eu-west-1"] } }
/// ```
///
/// # Response (202 Accepted)
///
/// ```json
/// { "operationId": "550e8400-e29b-41d4-a716-446655440000" }
/// ```
pub async fn scan(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    accept(&state, &auth, CommandKind::Scan, body)
}

/// `POST /api/v1/generate-iac`
pub async fn generate_iac(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    accept(&state, &auth, CommandKind::GenerateIac, body)
}

/// `POST /api/v1/generate-spec`
pub async fn generate_spec(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    accept(&state, &auth, CommandKind::GenerateSpec, body)
}

/// `POST /api/v1/deploy`. Deploys cannot be cancelled once running.
pub async fn deploy(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    accept(&state, &auth, CommandKind::Deploy, body)
}
