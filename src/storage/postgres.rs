//! PostgreSQL backend and migration management.
//!
//! This module provides:
//! - A [`GraphBackend`] that opens one `PgConnection` per pooled session
//! - Classification of driver errors into transient and permanent
//! - Running the journal migrations at startup
//!
//! Pooling is done by [`super::ConnectionManager`], not by sqlx.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::info;

use super::{GraphBackend, GraphSession, Param, Statement, StorageError};
use crate::config::Secret;

/// SQLSTATEs worth retrying: serialization failure, deadlock, cannot connect
/// now, too many connections. Class `08` (connection exception) is added
/// in [`classify`].
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "57P03", "53300"];

pub struct PgBackend {
    url: Secret<String>,
}

impl PgBackend {
    pub fn new(url: Secret<String>) -> Self {
        Self { url }
    }

    /// Run migrations from the `migrations/` directory.
    ///
    /// Migrations are tracked in the `_sqlx_migrations` table, so each one runs
    /// only once.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or a migration fails.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        let mut conn = PgConnection::connect(self.url.expose())
            .await
            .map_err(classify)?;
        // The macro embeds ./migrations at compile time
        sqlx::migrate!("./migrations")
            .run(&mut conn)
            .await
            .map_err(|e| StorageError::Permanent(format!("migration failed: {e}")))?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl GraphBackend for PgBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<Box<dyn GraphSession>, StorageError> {
        let conn = PgConnection::connect(self.url.expose())
            .await
            .map_err(classify)?;
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl GraphSession for PgSession {
    async fn ping(&mut self) -> Result<(), StorageError> {
        self.conn.ping().await.map_err(classify)
    }

    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64, StorageError> {
        let mut tx = self.conn.begin().await.map_err(classify)?;
        let mut rows = 0;

        for statement in statements {
            let mut query = sqlx::query(&statement.text);
            for param in &statement.params {
                query = match param {
                    Param::Text(v) => query.bind(v.clone()),
                    Param::OptText(v) => query.bind(v.clone()),
                    Param::Int(v) => query.bind(*v),
                    Param::Uuid(v) => query.bind(*v),
                    Param::Json(v) => query.bind(v.clone()),
                    Param::Timestamp(v) => query.bind(*v),
                    Param::OptTimestamp(v) => query.bind(*v),
                };
            }
            // Dropping `tx` on error rolls the batch back.
            rows += query.execute(&mut *tx).await.map_err(classify)?.rows_affected();
        }

        tx.commit().await.map_err(classify)?;
        Ok(rows)
    }
}

/// Sort a driver error into transient (retry) or permanent (surface).
pub fn classify(err: sqlx::Error) -> StorageError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code) || code.starts_with("08")),
        _ => false,
    };

    if transient {
        StorageError::Transient(err.to_string())
    } else {
        StorageError::Permanent(err.to_string())
    }
}
