//! The "execute command, emit progress, return result" contract.
//!
//! Scanners, IaC emitters and deployers plug in as [`CommandHandler`]s. The
//! same handler runs unchanged in-process (local mode) or inside the API
//! server's worker (remote mode); both paths go through [`run_handler`].

mod cancel;
mod sink;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

pub use cancel::CancellationFlag;
pub use sink::ProgressSink;

use crate::{
    error::AppError,
    models::{
        operation::{CommandKind, OperationStatus},
        progress::CompletionPayload,
    },
    storage::ConnectionManager,
};

/// Everything a handler gets for one run.
#[derive(Clone)]
pub struct HandlerContext {
    pub operation_id: Uuid,
    pub kind: CommandKind,
    pub tenant_id: String,
    pub params: Value,
    pub progress: ProgressSink,
    pub cancel: CancellationFlag,
    /// Present when running server-side with a database.
    pub pool: Option<Arc<ConnectionManager>>,
}

impl HandlerContext {
    /// Safe point: fails with [`AppError::Cancelled`] once cancellation is requested.
    ///
    /// # Errors
    ///
    /// [`AppError::Cancelled`] if the flag is set.
    pub fn checkpoint(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command to completion and return its result document.
    ///
    /// Progress goes through `ctx.progress`; the terminal completion message is
    /// emitted by the caller, not by the handler.
    async fn execute(&self, ctx: &HandlerContext) -> Result<Value, AppError>;
}

/// Command kind to handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with(mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: CommandKind) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

/// Run a handler under a timeout and emit its completion message.
///
/// Handler outcomes map onto terminal statuses:
///
/// | outcome                                   | status      |
/// |-------------------------------------------|-------------|
/// | `Ok(result)`                              | `Succeeded` |
/// | `Err(Cancelled)` on a cancellable kind    | `Cancelled` |
/// | any other `Err`                           | `Failed`    |
/// | timeout elapsed                           | `TimedOut`  |
pub async fn run_handler(
    handler: Arc<dyn CommandHandler>,
    ctx: HandlerContext,
    timeout: Duration,
) -> CompletionPayload {
    let outcome = tokio::time::timeout(timeout, handler.execute(&ctx)).await;

    let completion = match outcome {
        Ok(Ok(result)) => CompletionPayload {
            status: OperationStatus::Succeeded,
            result: Some(result),
            error: None,
        },
        Ok(Err(AppError::Cancelled)) if ctx.kind.supports_cancellation() => CompletionPayload {
            status: OperationStatus::Cancelled,
            result: None,
            error: Some(AppError::Cancelled.to_string()),
        },
        Ok(Err(err)) => {
            warn!(operation_id = %ctx.operation_id, kind = %ctx.kind, error = %err, "command failed");
            CompletionPayload {
                status: OperationStatus::Failed,
                result: None,
                error: Some(err.to_string()),
            }
        }
        Err(_) => {
            warn!(operation_id = %ctx.operation_id, kind = %ctx.kind, ?timeout, "command timed out");
            CompletionPayload {
                status: OperationStatus::TimedOut,
                result: None,
                error: Some(format!("exceeded {}s", timeout.as_secs_f64())),
            }
        }
    };

    info!(
        operation_id = %ctx.operation_id,
        kind = %ctx.kind,
        status = %completion.status,
        "command finished"
    );
    ctx.progress.complete(completion.clone()).await;
    completion
}
