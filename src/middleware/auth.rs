//! API key authentication middleware.
//!
//! This middleware intercepts every protected request to:
//! 1. Extract the API key from the Authorization header
//! 2. Validate it with the [`Authenticator`] (format, MAC, expiry, rate limit)
//! 3. Inject the resulting [`AuthContext`] into the request
//! 4. Reject everything else before any handler or pool access

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{
    error::AppError,
    models::api_key::redact,
    services::authenticator::{AuthError, Authenticator},
};

/// API key authentication middleware function.
///
/// # Headers
///
/// Expected header format:
/// ```text
/// Authorization: Bearer sr_dev_1a2b3c4d_<secret>
/// ```
///
/// # Returns
///
/// - `Ok(Response)` from the next handler once the key is accepted
/// - `Err(AppError::Authentication)` (401) for a missing or rejected key
/// - `Err(AppError::RateLimited)` (429) when the key's bucket is empty
pub async fn auth_middleware(
    State(authenticator): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::Missing)?;

    let context = authenticator.validate(token).map_err(|err| {
        warn!(key = %redact(token), reason = %err, "request rejected");
        err
    })?;

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
