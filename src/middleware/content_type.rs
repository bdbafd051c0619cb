//! Reject mutating requests that are not JSON before their body is read.

use axum::{
    extract::Request,
    http::{Method, header::CONTENT_TYPE},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;

fn is_json(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json")
        || essence
            .rsplit_once('+')
            .is_some_and(|(_, suffix)| suffix.eq_ignore_ascii_case("json"))
}

/// 415 for `POST`/`PUT`/`PATCH` requests whose content type is not JSON.
///
/// Bodiless posts (the cancel endpoint) pass without a content type.
pub async fn require_json(request: Request, next: Next) -> Result<Response, AppError> {
    let mutating = matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
    if mutating {
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        let has_body = request
            .headers()
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .is_none_or(|len| len.trim() != "0");

        match content_type {
            Some(value) if is_json(value) => {}
            None if !has_body => {}
            _ => return Err(AppError::UnsupportedMediaType),
        }
    }
    Ok(next.run(request).await)
}
