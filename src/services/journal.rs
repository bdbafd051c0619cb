//! Durable record of finished operations and their progress history.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::{operation::Operation, progress::ProgressMessage},
    storage::{ChunkReport, ConnectionManager, Param, Statement, StorageError},
};

const UPSERT_OPERATION: &str = r#"
    INSERT INTO operation_journal
        (id, kind, status, tenant_id, progress_percent, result, error, created_at, started_at, finished_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (id) DO UPDATE SET
        status = EXCLUDED.status,
        progress_percent = EXCLUDED.progress_percent,
        result = EXCLUDED.result,
        error = EXCLUDED.error,
        started_at = EXCLUDED.started_at,
        finished_at = EXCLUDED.finished_at
"#;

const INSERT_PROGRESS: &str = r#"
    INSERT INTO operation_progress (operation_id, sequence, kind, payload, emitted_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (operation_id, sequence) DO NOTHING
"#;

/// Writes operations and their progress through the connection manager.
///
/// Statements are idempotent, so a chunk replayed by the retry loop leaves
/// the same rows behind.
pub struct Journal {
    pool: Arc<ConnectionManager>,
    chunk_size: usize,
}

impl Journal {
    pub fn new(pool: Arc<ConnectionManager>, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn operation_statement(operation: &Operation) -> Statement {
        Statement::new(UPSERT_OPERATION)
            .bind(Param::Uuid(operation.id))
            .bind(Param::Text(operation.kind.as_str().to_string()))
            .bind(Param::Text(operation.status.as_str().to_string()))
            .bind(Param::Text(operation.tenant_id.clone()))
            .bind(Param::Int(i64::from(operation.progress_percent)))
            .bind(Param::Json(
                operation.result.clone().unwrap_or(serde_json::Value::Null),
            ))
            .bind(Param::OptText(operation.error.clone()))
            .bind(Param::Timestamp(operation.created_at))
            .bind(Param::OptTimestamp(operation.started_at))
            .bind(Param::OptTimestamp(operation.finished_at))
    }

    pub fn progress_statement(message: &ProgressMessage) -> Statement {
        Statement::new(INSERT_PROGRESS)
            .bind(Param::Uuid(message.operation_id))
            .bind(Param::Int(i64::try_from(message.sequence).unwrap_or(i64::MAX)))
            .bind(Param::Text(message.kind.as_str().to_string()))
            .bind(Param::Json(message.payload.clone()))
            .bind(Param::Timestamp(message.timestamp))
    }

    /// Upsert the operation row. Written once when the worker starts, so
    /// progress rows have a parent, and again with the terminal state.
    ///
    /// # Errors
    ///
    /// The [`StorageError`] that survived the retry policy.
    pub async fn record_operation(&self, operation: &Operation) -> Result<ChunkReport, StorageError> {
        let report = self
            .pool
            .chunked_transaction(&[Self::operation_statement(operation)], 1, None)
            .await?;
        debug!(operation_id = %operation.id, status = %operation.status, "operation journaled");
        Ok(report)
    }

    /// [`Journal::record_operation`], logging instead of failing.
    pub async fn record_operation_or_warn(&self, operation: &Operation) {
        if let Err(err) = self.record_operation(operation).await {
            warn!(operation_id = %operation.id, error = %err, "failed to journal operation");
        }
    }

    /// Insert a batch of progress rows.
    ///
    /// # Errors
    ///
    /// The [`StorageError`] that survived the retry policy.
    pub async fn record_progress(&self, batch: &[ProgressMessage]) -> Result<ChunkReport, StorageError> {
        let statements: Vec<_> = batch.iter().map(Self::progress_statement).collect();
        self.pool
            .chunked_transaction(&statements, self.chunk_size, None)
            .await
    }

    /// Start buffering progress for one operation.
    pub fn writer(self: &Arc<Self>, operation_id: Uuid) -> ProgressWriter {
        ProgressWriter {
            journal: Arc::clone(self),
            operation_id,
            pending: Vec::with_capacity(self.chunk_size),
            written: 0,
            dropped: 0,
        }
    }
}

/// Buffers at most `chunk_size` progress messages and writes each full batch
/// as it fills, so memory stays bounded however long the operation runs.
///
/// A batch that cannot be written is logged and dropped; the operation itself
/// is not affected.
pub struct ProgressWriter {
    journal: Arc<Journal>,
    operation_id: Uuid,
    pending: Vec<ProgressMessage>,
    written: u64,
    dropped: u64,
}

impl ProgressWriter {
    pub async fn push(&mut self, message: ProgressMessage) {
        self.pending.push(message);
        if self.pending.len() >= self.journal.chunk_size {
            self.flush().await;
        }
    }

    /// Write whatever is buffered.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.journal.chunk_size));
        let count = batch.len() as u64;
        match self.journal.record_progress(&batch).await {
            Ok(_) => self.written += count,
            Err(err) => {
                self.dropped += count;
                warn!(
                    operation_id = %self.operation_id,
                    error = %err,
                    messages = count,
                    "failed to journal progress batch"
                );
            }
        }
    }

    /// Flush the tail and report how many messages were written and dropped.
    pub async fn finish(mut self) -> (u64, u64) {
        self.flush().await;
        if self.dropped > 0 {
            info!(
                operation_id = %self.operation_id,
                written = self.written,
                dropped = self.dropped,
                "progress journal incomplete"
            );
        }
        (self.written, self.dropped)
    }
}
