//! In-process backend selected by `memory://` database URIs.
//!
//! Keeps every applied statement in order. Used by the dev profile and by
//! tests, which can also inject connect, batch and probe failures.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{GraphBackend, GraphSession, Statement, StorageError};

#[derive(Debug, Default)]
struct MemoryState {
    applied: Vec<Statement>,
    sessions_opened: usize,
    connect_failures: u32,
    batch_failures: u32,
    ping_failing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every statement committed so far, in commit order.
    pub fn applied(&self) -> Vec<Statement> {
        self.state().applied.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Fail the next `n` connect attempts with a transient error.
    pub fn inject_connect_failures(&self, n: u32) {
        self.state().connect_failures = n;
    }

    /// Fail the next `n` batches with a transient error.
    pub fn inject_batch_failures(&self, n: u32) {
        self.state().batch_failures = n;
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.state().ping_failing = failing;
    }
}

#[async_trait]
impl GraphBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn GraphSession>, StorageError> {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(StorageError::Transient("connection refused".into()));
        }
        state.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            backend: self.clone(),
        }))
    }
}

struct MemorySession {
    backend: MemoryBackend,
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn ping(&mut self) -> Result<(), StorageError> {
        if self.backend.state().ping_failing {
            return Err(StorageError::Transient("ping failed".into()));
        }
        Ok(())
    }

    async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64, StorageError> {
        let mut state = self.backend.state();
        if state.batch_failures > 0 {
            state.batch_failures -= 1;
            return Err(StorageError::Transient("connection reset by peer".into()));
        }
        state.applied.extend_from_slice(statements);
        Ok(statements.len() as u64)
    }
}
