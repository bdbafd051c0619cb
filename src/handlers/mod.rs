//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives request data (JSON body, path params, upgraded socket)
//! 2. Calls into the services layer
//! 3. Returns a JSON response or an [`crate::error::AppError`]

/// Long-running command endpoints
pub mod commands;
pub mod health;
/// Status and cancellation
pub mod operations;
/// Progress over WebSocket
pub mod stream;
