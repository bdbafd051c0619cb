//! scanrelay: remote execution for long-running infrastructure commands.
//!
//! Scans, IaC generation, spec generation and deploys run either in-process
//! or on an API server that streams their progress back over WebSocket. The
//! [`dispatcher::Dispatcher`] hides which one is used; both paths share the
//! [`execution::CommandHandler`] contract and produce the same
//! [`models::command::CommandResult`].
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (HTTP + WebSocket)
//! - **Database**: graph storage behind [`storage::GraphBackend`], PostgreSQL via sqlx
//! - **Authentication**: environment-scoped API keys verified with HMAC-SHA256
//! - **Format**: camelCase JSON requests, responses and progress frames

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod server;
pub mod services;
pub mod storage;

#[cfg(test)]
mod test_support;
