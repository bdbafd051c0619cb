//! Graph-database access: driver adapters, the connection manager and retry.

mod backend;
mod memory;
mod pool;
mod postgres;
mod retry;

use std::sync::Arc;

use url::Url;

pub use backend::{GraphBackend, GraphSession, Param, Statement, StorageError};
pub use memory::MemoryBackend;
pub use pool::{ChunkReport, ConnectionManager, ConnectionState, PoolMetrics, PoolSettings, PooledConnection};
pub use postgres::{PgBackend, classify};
pub use retry::{RetryPolicy, with_retry};

use crate::config::Secret;

/// Pick a backend from the database URI scheme.
///
/// PostgreSQL backends have their migrations applied before being returned.
///
/// # Errors
///
/// [`StorageError::Permanent`] for an unknown scheme or a failed migration,
/// [`StorageError::Transient`] if the database cannot be reached.
pub async fn connect_backend(uri: &Secret<String>) -> Result<Arc<dyn GraphBackend>, StorageError> {
    let scheme = Url::parse(uri.expose())
        .map(|url| url.scheme().to_string())
        .map_err(|e| StorageError::Permanent(format!("invalid database uri: {e}")))?;

    match scheme.as_str() {
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        "postgres" | "postgresql" => {
            let backend = PgBackend::new(uri.clone());
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        other => Err(StorageError::Permanent(format!(
            "unsupported database scheme `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_scheme_selects_memory_backend() {
        let backend = connect_backend(&Secret::new("memory://local".into()))
            .await
            .unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn unknown_scheme_is_permanent() {
        let err = connect_backend(&Secret::new("mysql://db/graph".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Permanent(_)));
    }
}
