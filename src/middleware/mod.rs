//! HTTP middleware components.
//!
//! Middleware run before route handlers and can short-circuit a request:
//! authentication rejects unknown keys, the content-type guard rejects
//! non-JSON bodies on mutating routes.

/// API key authentication middleware
pub mod auth;
pub mod content_type;
