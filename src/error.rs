//! Error types and HTTP error response handling.
//!
//! This module defines the application-wide error taxonomy and how each
//! variant is converted into an HTTP response with a status code and JSON body.
//! The same enum is what [`crate::dispatcher::Dispatcher`] callers see, whether
//! the command ran in-process or on a remote server.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::ConfigError,
    models::{command::ValidationErrors, operation::OperationStatus},
    services::authenticator::AuthError,
    storage::StorageError,
};

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Authentication**: invalid, expired or revoked keys (never retried)
/// - **Validation**: malformed requests (surfaced immediately)
/// - **Capacity**: rate limiting and pool exhaustion (surfaced with retry guidance)
/// - **Storage**: transient faults that escaped the retry loop, or permanent faults
/// - **Operation lifecycle**: unknown operations, invalid state transitions
/// - **Internal**: anything unexpected, rendered opaque to clients
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Credential rejected. Rendered with a generic message.
    #[error("authentication failed: {0}")]
    Authentication(AuthError),

    /// Request body or parameters are invalid.
    #[error("invalid request: {0}")]
    Validation(ValidationErrors),

    /// Per-key token bucket is empty.
    #[error("rate limit exceeded, retry after {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    /// No pool connection became free within the acquire timeout.
    #[error("connection pool exhausted after waiting {waited:?} (pool size {max_size})")]
    PoolExhausted { waited: Duration, max_size: usize },

    /// Storage failure that was still transient after retries were exhausted.
    #[error("storage temporarily unavailable: {0}")]
    TransientStorage(String),

    /// Storage failure that will not go away by retrying.
    #[error("storage error: {0}")]
    PermanentStorage(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Mutating route called without a JSON content type.
    #[error("content type must be application/json")]
    UnsupportedMediaType,

    #[error("operation {0} not found")]
    OperationNotFound(Uuid),

    /// Requested state change is not an edge of the operation state machine.
    #[error("operation cannot move from {from} to {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    /// No handler is registered for the requested command.
    #[error("command not available: {0}")]
    Unsupported(String),

    /// Cooperative cancellation was observed at a safe point.
    #[error("operation cancelled")]
    Cancelled,

    /// The command handler reported a failure.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Error response received from a remote execution server.
    #[error("remote server returned {status} ({code}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unexpected fault. Logged with full context, rendered opaque.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Authentication(_) => "unauthorized",
            AppError::Validation(_) => "validation_error",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::PoolExhausted { .. } => "pool_exhausted",
            AppError::TransientStorage(_) => "storage_unavailable",
            AppError::PermanentStorage(_) => "storage_error",
            AppError::Timeout(_) => "timeout",
            AppError::UnsupportedMediaType => "unsupported_media_type",
            AppError::OperationNotFound(_) => "operation_not_found",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Unsupported(_) => "unsupported_command",
            AppError::Cancelled => "cancelled",
            AppError::CommandFailed(_) => "command_failed",
            AppError::Remote { .. } => "remote_error",
            AppError::Config(_) | AppError::Internal(_) => "internal_error",
        }
    }

    /// Rebuild an error from a remote server's JSON error body.
    ///
    /// Codes that carry caller-actionable meaning (rate limiting, validation,
    /// authentication, pool exhaustion) map back onto their local variants so
    /// callers can react the same way in both execution modes.
    pub fn from_remote(
        status: u16,
        code: &str,
        message: String,
        retry_after: Option<Duration>,
        details: Option<ValidationErrors>,
    ) -> Self {
        match code {
            "unauthorized" => AppError::Authentication(AuthError::Rejected),
            "rate_limited" => AppError::RateLimited {
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
            },
            "validation_error" => AppError::Validation(
                details.unwrap_or_else(|| ValidationErrors::single("body", message)),
            ),
            "unsupported_media_type" => AppError::UnsupportedMediaType,
            "timeout" => AppError::Timeout(message),
            _ => AppError::Remote {
                status,
                code: code.to_string(),
                message,
            },
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::RateLimited { retry_after } => AppError::RateLimited { retry_after },
            other => AppError::Authentication(other),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => AppError::TransientStorage(msg),
            StorageError::Permanent(msg) => AppError::PermanentStorage(msg),
            StorageError::PoolExhausted { waited, max_size } => {
                AppError::PoolExhausted { waited, max_size }
            }
            StorageError::Timeout(msg) => AppError::Timeout(msg),
            StorageError::Cancelled => AppError::Cancelled,
            StorageError::Closed => AppError::TransientStorage(err.to_string()),
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message",
///     "details": [{ "field": "tenantId", "message": "..." }]
///   }
/// }
/// ```
///
/// `details` is only present for validation errors. Rate limiting and pool
/// exhaustion also set a `Retry-After` header.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let mut retry_after = None;

        let (status, message) = match &self {
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing API key".to_string(),
            ),
            AppError::Validation(errors) => (StatusCode::BAD_REQUEST, errors.to_string()),
            AppError::RateLimited { retry_after: wait } => {
                retry_after = Some(*wait);
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            AppError::PoolExhausted { .. } => {
                retry_after = Some(Duration::from_secs(1));
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::TransientStorage(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage is temporarily unavailable".to_string(),
            ),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::UnsupportedMediaType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, self.to_string())
            }
            AppError::OperationNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InvalidTransition { .. } | AppError::Cancelled => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            AppError::CommandFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            AppError::Remote { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                self.to_string(),
            ),
            AppError::PermanentStorage(_) | AppError::Config(_) | AppError::Internal(_) => {
                tracing::error!(error = ?self, "internal error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let AppError::Validation(errors) = &self {
            error["details"] = json!(errors.fields());
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let Some(wait) = retry_after {
            let secs = wait.as_secs().max(1).to_string();
            if let Ok(value) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
