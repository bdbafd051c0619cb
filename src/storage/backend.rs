//! Driver-facing traits for the graph database.
//!
//! The connection manager only ever talks to a database through
//! [`GraphBackend`] (to open sessions) and [`GraphSession`] (to use them).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Storage failures, split by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Service unavailable, contention, connection reset.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Permanent(String),

    #[error("no connection available after {waited:?} (max {max_size})")]
    PoolExhausted { waited: Duration, max_size: usize },

    #[error("storage call timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("connection manager is shut down")]
    Closed,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// A typed statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    Uuid(Uuid),
    Json(Value),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
}

/// One write statement with positional (`$1`, `$2`, …) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }
}

/// Opens sessions. One per configured database.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Short name for logs (`postgres`, `memory`).
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn GraphSession>, StorageError>;
}

/// A single open database session. Dropping it closes the session.
#[async_trait]
pub trait GraphSession: Send {
    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), StorageError>;

    /// Run `statements` in one transaction and return the rows affected.
    /// Nothing is applied if any statement fails.
    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64, StorageError>;
}
