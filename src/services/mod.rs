//! Server-side services.
//!
//! Services hold the state and logic behind the HTTP handlers: credential
//! validation, rate limiting, operation bookkeeping, progress streaming and
//! the workers that run commands.

pub mod authenticator;
pub mod journal;
pub mod operations;
pub mod process_handler;
pub mod rate_limiter;
pub mod runner;
pub mod stream_manager;
