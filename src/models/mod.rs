//! Data models shared by the server, the dispatcher and the wire protocol.

/// API key tokens and records
pub mod api_key;
/// Command requests, results and validation errors
pub mod command;
/// Operation lifecycle
pub mod operation;
/// Progress envelope and stream frames
pub mod progress;
