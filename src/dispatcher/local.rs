//! In-process execution. No network is touched on this path.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::{
    error::AppError,
    execution::{CancellationFlag, HandlerContext, HandlerRegistry, ProgressSink, run_handler},
    models::{
        command::{CommandRequest, CommandResult},
        operation::CommandKind,
        progress::ProgressMessage,
    },
};

pub(super) struct LocalRun {
    pub operation_id: Uuid,
    pub progress: mpsc::Receiver<ProgressMessage>,
    pub outcome: JoinHandle<Result<CommandResult, AppError>>,
}

/// Start `kind` on a spawned task.
///
/// # Errors
///
/// - [`AppError::Unsupported`] if no handler is registered
/// - [`AppError::Validation`] for an invalid request
pub(super) fn spawn(
    handlers: &HandlerRegistry,
    kind: CommandKind,
    request: CommandRequest,
    cancel: CancellationFlag,
    timeout: Duration,
    buffer: usize,
) -> Result<LocalRun, AppError> {
    let handler = handlers
        .get(kind)
        .ok_or_else(|| AppError::Unsupported(kind.to_string()))?;
    let request = request.validate().map_err(AppError::Validation)?;

    let operation_id = Uuid::new_v4();
    let (sink, progress) = ProgressSink::channel(operation_id, buffer);
    let ctx = HandlerContext {
        operation_id,
        kind,
        tenant_id: request.tenant_id,
        params: request.params,
        progress: sink,
        cancel,
        pool: None,
    };

    let span = info_span!("local_operation", %operation_id, %kind);
    let outcome = tokio::spawn(
        async move {
            let done = run_handler(handler, ctx, timeout).await;
            Ok(CommandResult {
                operation_id,
                kind,
                status: done.status,
                result: done.result,
                error: done.error,
            })
        }
        .instrument(span),
    );

    Ok(LocalRun {
        operation_id,
        progress,
        outcome,
    })
}
