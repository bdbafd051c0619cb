//! Server-side operation workers.
//!
//! `submit` records a `Queued` operation and returns its id at once; the
//! command itself runs on a spawned worker:
//!
//! 1. Move the operation to `Running` (or finish it as `Cancelled` if a cancel
//!    arrived first).
//! 2. Run the handler under the operation timeout. Its progress is pumped into
//!    the operation registry, the stream manager and (in batches) the journal
//!    as it is emitted.
//! 3. Record the terminal state and journal the operation.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

use super::{
    journal::{Journal, ProgressWriter},
    operations::OperationRegistry,
    stream_manager::{StreamManager, publish_or_warn},
};
use crate::{
    error::AppError,
    execution::{CancellationFlag, CommandHandler, HandlerContext, HandlerRegistry, ProgressSink, run_handler},
    models::{
        command::CommandRequest,
        operation::{CommandKind, Operation, OperationStatus},
        progress::{CompletionPayload, ProgressMessage},
    },
    storage::ConnectionManager,
};

pub struct OperationRunner {
    handlers: HandlerRegistry,
    operations: Arc<OperationRegistry>,
    streams: Arc<StreamManager>,
    pool: Option<Arc<ConnectionManager>>,
    journal: Option<Arc<Journal>>,
    timeout: Duration,
    progress_buffer: usize,
}

impl OperationRunner {
    pub fn new(
        handlers: HandlerRegistry,
        operations: Arc<OperationRegistry>,
        streams: Arc<StreamManager>,
        timeout: Duration,
        progress_buffer: usize,
    ) -> Self {
        Self {
            handlers,
            operations,
            streams,
            pool: None,
            journal: None,
            timeout,
            progress_buffer,
        }
    }

    /// Give handlers access to the pool and journal finished operations.
    pub fn with_storage(mut self, pool: Arc<ConnectionManager>, chunk_size: usize) -> Self {
        self.journal = Some(Arc::new(Journal::new(Arc::clone(&pool), chunk_size)));
        self.pool = Some(pool);
        self
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn supports(&self, kind: CommandKind) -> bool {
        self.handlers.contains(kind)
    }

    /// Accept a command and start its worker.
    ///
    /// # Errors
    ///
    /// - [`AppError::Unsupported`] if no handler is registered for `kind`
    /// - [`AppError::Validation`] for an invalid request
    pub fn submit(&self, kind: CommandKind, request: CommandRequest) -> Result<Uuid, AppError> {
        let handler = self
            .handlers
            .get(kind)
            .ok_or_else(|| AppError::Unsupported(kind.to_string()))?;
        let request = request.validate().map_err(AppError::Validation)?;

        let (operation, cancel) = self.operations.create(kind, &request.tenant_id);
        self.streams.register(operation.id);

        let span = info_span!("operation", operation_id = %operation.id, kind = %kind);
        let worker = Worker {
            operations: Arc::clone(&self.operations),
            streams: Arc::clone(&self.streams),
            pool: self.pool.clone(),
            journal: self.journal.clone(),
            timeout: self.timeout,
            progress_buffer: self.progress_buffer,
        };
        tokio::spawn(worker.run(handler, operation.clone(), request, cancel).instrument(span));

        Ok(operation.id)
    }

    /// # Errors
    ///
    /// See [`OperationRegistry::request_cancel`].
    pub fn cancel(&self, id: Uuid) -> Result<Operation, AppError> {
        self.operations.request_cancel(id)
    }
}

struct Worker {
    operations: Arc<OperationRegistry>,
    streams: Arc<StreamManager>,
    pool: Option<Arc<ConnectionManager>>,
    journal: Option<Arc<Journal>>,
    timeout: Duration,
    progress_buffer: usize,
}

impl Worker {
    async fn run(
        self,
        handler: Arc<dyn CommandHandler>,
        operation: Operation,
        request: CommandRequest,
        cancel: CancellationFlag,
    ) {
        let id = operation.id;
        // The parent row goes first so progress batches can reference it.
        let writer = match &self.journal {
            Some(journal) => {
                journal.record_operation_or_warn(&operation).await;
                Some(journal.writer(id))
            }
            None => None,
        };
        let (progress, rx) = ProgressSink::channel(id, self.progress_buffer);
        let pump = tokio::spawn(pump(
            rx,
            Arc::clone(&self.operations),
            Arc::clone(&self.streams),
            writer,
        ));

        let completion = match self.operations.transition(id, OperationStatus::Running) {
            Ok(_) => {
                let ctx = HandlerContext {
                    operation_id: id,
                    kind: operation.kind,
                    tenant_id: request.tenant_id,
                    params: request.params,
                    progress,
                    cancel,
                    pool: self.pool.clone(),
                };
                run_handler(handler, ctx, self.timeout).await
            }
            // Cancelled while still queued.
            Err(_) => {
                let completion = CompletionPayload {
                    status: OperationStatus::Cancelled,
                    result: None,
                    error: Some(AppError::Cancelled.to_string()),
                };
                progress.complete(completion.clone()).await;
                completion
            }
        };

        if let Err(err) = pump.await {
            warn!(error = %err, "progress pump failed");
        }

        let finished = match self.operations.finish(id, &completion) {
            Ok(op) => op,
            Err(err) => {
                warn!(error = %err, "could not record operation outcome");
                return;
            }
        };
        if let Some(journal) = &self.journal {
            journal.record_operation_or_warn(&finished).await;
        }
    }
}

/// Forward handler progress to the registry, stream and journal until the
/// completion message.
async fn pump(
    mut rx: mpsc::Receiver<ProgressMessage>,
    operations: Arc<OperationRegistry>,
    streams: Arc<StreamManager>,
    mut journal: Option<ProgressWriter>,
) {
    while let Some(message) = rx.recv().await {
        operations.record_progress(&message);
        let done = message.is_completion();
        match journal.as_mut() {
            Some(writer) => {
                publish_or_warn(&streams, message.clone());
                writer.push(message).await;
            }
            None => publish_or_warn(&streams, message),
        }
        if done {
            break;
        }
    }
    if let Some(writer) = journal {
        writer.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::stream_manager::StreamSettings,
        storage::{MemoryBackend, Param, PoolSettings},
        test_support::{Blocking, Echo},
    };
    use serde_json::json;

    fn runner(handlers: HandlerRegistry) -> OperationRunner {
        OperationRunner::new(
            handlers,
            Arc::new(OperationRegistry::new(Duration::from_secs(60))),
            Arc::new(StreamManager::new(StreamSettings::default())),
            Duration::from_secs(5),
            16,
        )
    }

    async fn wait_terminal(runner: &OperationRunner, id: Uuid) -> Operation {
        for _ in 0..200 {
            if let Some(op) = runner.operations().get(id) {
                if op.status.is_terminal() {
                    return op;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation {id} never finished");
    }

    #[tokio::test]
    async fn submitted_operation_runs_and_publishes() {
        let runner = runner(HandlerRegistry::new().with(CommandKind::Scan, Arc::new(Echo)));
        let id = runner
            .submit(CommandKind::Scan, CommandRequest::new("tenant-a", json!({ "x": 1 })))
            .unwrap();

        let op = wait_terminal(&runner, id).await;
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.result, Some(json!({ "echo": { "x": 1 } })));
        // info, progress, completion
        assert_eq!(runner.streams().last_sequence(id), Some(3));
    }

    #[tokio::test]
    async fn unknown_kind_and_invalid_request_are_rejected() {
        let runner = runner(HandlerRegistry::new().with(CommandKind::Scan, Arc::new(Echo)));
        assert!(matches!(
            runner.submit(CommandKind::Deploy, CommandRequest::new("t", json!({}))),
            Err(AppError::Unsupported(_))
        ));
        assert!(matches!(
            runner.submit(CommandKind::Scan, CommandRequest::new("", json!({}))),
            Err(AppError::Validation(_))
        ));
        assert!(runner.operations().is_empty());
    }

    #[tokio::test]
    async fn running_operation_can_be_cancelled() {
        let runner = runner(HandlerRegistry::new().with(CommandKind::Scan, Arc::new(Blocking)));
        let id = runner
            .submit(CommandKind::Scan, CommandRequest::new("t", json!({})))
            .unwrap();

        for _ in 0..100 {
            if runner.operations().get(id).map(|op| op.status) == Some(OperationStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runner.cancel(id).unwrap();

        let op = wait_terminal(&runner, id).await;
        assert_eq!(op.status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn finished_operations_are_journaled() {
        let backend = MemoryBackend::new();
        let pool = ConnectionManager::new(Arc::new(backend.clone()), PoolSettings::default());
        let runner = runner(HandlerRegistry::new().with(CommandKind::GenerateSpec, Arc::new(Echo)))
            .with_storage(pool, 50);

        let id = runner
            .submit(CommandKind::GenerateSpec, CommandRequest::new("t", json!({})))
            .unwrap();
        wait_terminal(&runner, id).await;

        // Queued row, one progress batch, terminal row.
        for _ in 0..200 {
            if backend.applied().len() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let applied = backend.applied();
        assert_eq!(applied.len(), 5);
        assert!(applied[0].text.contains("operation_journal"));
        assert_eq!(applied[0].params[2], Param::Text("queued".into()));
        assert!(applied[1..4].iter().all(|s| s.text.contains("operation_progress")));
        assert_eq!(applied[4].params[2], Param::Text("succeeded".into()));
    }
}
