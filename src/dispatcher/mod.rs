//! One entry point for running commands locally or against a remote server.
//!
//! Callers get the same [`Execution`] either way: a stream of progress
//! messages with gapless sequences and a terminal [`CommandResult`] of the
//! same shape. Errors are [`AppError`]s in both modes; remote error bodies are
//! mapped back onto the local variants.

mod local;
mod remote;

use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

pub use remote::RemoteClient;

use crate::{
    config::{ClientConfig, ConfigError},
    error::AppError,
    execution::{CancellationFlag, HandlerRegistry},
    models::{
        command::{CommandRequest, CommandResult, ExecutionMode},
        operation::CommandKind,
        progress::ProgressMessage,
    },
};

/// Progress of one execution, in sequence order.
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressMessage>,
}

impl ProgressStream {
    /// Next message, `None` once the execution has finished.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.rx.recv().await
    }
}

impl Stream for ProgressStream {
    type Item = ProgressMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A started command.
///
/// Progress is delivered through a bounded channel; a caller that wants it
/// must [`take_progress`](Execution::take_progress) and drain it, otherwise a
/// chatty command waits for room. [`wait`](Execution::wait) drops an untaken
/// stream first.
pub struct Execution {
    pub operation_id: Uuid,
    pub mode: ExecutionMode,
    progress: Option<ProgressStream>,
    outcome: JoinHandle<Result<CommandResult, AppError>>,
    cancel: CancellationFlag,
}

impl Execution {
    pub fn take_progress(&mut self) -> Option<ProgressStream> {
        self.progress.take()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal result.
    ///
    /// # Errors
    ///
    /// Whatever stopped the command from reaching a terminal state.
    pub async fn wait(mut self) -> Result<CommandResult, AppError> {
        drop(self.progress.take());
        match self.outcome.await {
            Ok(result) => result,
            Err(err) => Err(AppError::Internal(anyhow::anyhow!("execution task failed: {err}"))),
        }
    }
}

/// Invocation counters for one mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModeStats {
    pub invocations: u64,
    pub failures: u64,
    pub average_duration: Duration,
}

#[derive(Debug, Default)]
struct Totals {
    invocations: u64,
    failures: u64,
    elapsed: Duration,
}

impl Totals {
    fn snapshot(&self) -> ModeStats {
        let average_duration = u32::try_from(self.invocations)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.elapsed / n);
        ModeStats {
            invocations: self.invocations,
            failures: self.failures,
            average_duration,
        }
    }
}

/// Per-mode counts, failures and average duration.
#[derive(Debug, Default)]
pub struct DispatchStats {
    local: Mutex<Totals>,
    remote: Mutex<Totals>,
}

impl DispatchStats {
    fn totals(&self, mode: ExecutionMode) -> MutexGuard<'_, Totals> {
        let totals = match mode {
            ExecutionMode::Local => &self.local,
            ExecutionMode::Remote => &self.remote,
        };
        totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, mode: ExecutionMode, elapsed: Duration, success: bool) {
        let mut totals = self.totals(mode);
        totals.invocations += 1;
        totals.elapsed += elapsed;
        if !success {
            totals.failures += 1;
        }
    }

    pub fn snapshot(&self, mode: ExecutionMode) -> ModeStats {
        self.totals(mode).snapshot()
    }
}

/// Runs commands in the configured or requested mode.
pub struct Dispatcher {
    config: ClientConfig,
    handlers: HandlerRegistry,
    remote: Option<RemoteClient>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Build a dispatcher. A remote client is created only when a server URL
    /// is configured.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if remote settings are present but unusable.
    pub fn new(config: ClientConfig, handlers: HandlerRegistry) -> Result<Self, AppError> {
        let remote = if config.server_url.is_some() {
            Some(RemoteClient::new(&config)?)
        } else {
            None
        };
        Ok(Self {
            config,
            handlers,
            remote,
            stats: Arc::new(DispatchStats::default()),
        })
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Start a command. `mode` overrides the configured default.
    ///
    /// # Errors
    ///
    /// Failures that happen before the command starts: unknown command,
    /// invalid request, missing remote configuration, or the server refusing
    /// the submission.
    pub async fn execute(
        &self,
        kind: CommandKind,
        request: CommandRequest,
        mode: Option<ExecutionMode>,
        cancel: CancellationFlag,
    ) -> Result<Execution, AppError> {
        let mode = mode.unwrap_or(self.config.mode);
        let started = Instant::now();
        debug!(%kind, %mode, "dispatching command");

        let launched = match mode {
            ExecutionMode::Local => self.launch_local(kind, request, cancel.clone()),
            ExecutionMode::Remote => self.launch_remote(kind, request, cancel.clone()).await,
        };
        let (operation_id, rx, outcome) = match launched {
            Ok(launched) => launched,
            Err(err) => {
                self.stats.record(mode, started.elapsed(), false);
                return Err(err);
            }
        };

        let stats = Arc::clone(&self.stats);
        let outcome = tokio::spawn(async move {
            let result = match outcome.await {
                Ok(result) => result,
                Err(err) => Err(AppError::Internal(anyhow::anyhow!("command task failed: {err}"))),
            };
            let success = result.as_ref().is_ok_and(CommandResult::is_success);
            stats.record(mode, started.elapsed(), success);
            result
        });

        Ok(Execution {
            operation_id,
            mode,
            progress: Some(ProgressStream { rx }),
            outcome,
            cancel,
        })
    }

    fn launch_local(
        &self,
        kind: CommandKind,
        request: CommandRequest,
        cancel: CancellationFlag,
    ) -> Result<Launched, AppError> {
        let run = local::spawn(
            &self.handlers,
            kind,
            request,
            cancel,
            self.config.operation_timeout,
            self.config.progress_buffer,
        )?;
        Ok((run.operation_id, run.progress, run.outcome))
    }

    async fn launch_remote(
        &self,
        kind: CommandKind,
        request: CommandRequest,
        cancel: CancellationFlag,
    ) -> Result<Launched, AppError> {
        let client = self
            .remote
            .clone()
            .ok_or(ConfigError::Missing("server_url"))?;
        let request = request.validate().map_err(AppError::Validation)?;
        let operation_id = client.submit(kind, &request).await?;

        let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let span = info_span!("remote_operation", %operation_id, %kind);
        let timeout = self.config.operation_timeout;
        let outcome = tokio::spawn(
            async move {
                tokio::time::timeout(timeout, client.follow(operation_id, kind, tx, cancel))
                    .await
                    .unwrap_or_else(|_| Err(AppError::Timeout(format!("operation {operation_id}"))))
            }
            .instrument(span),
        );
        Ok((operation_id, rx, outcome))
    }
}

type Launched = (
    Uuid,
    mpsc::Receiver<ProgressMessage>,
    JoinHandle<Result<CommandResult, AppError>>,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Profile,
        models::operation::OperationStatus,
        test_support::{Blocking, Echo, Failing},
    };
    use futures_util::StreamExt;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let handlers = HandlerRegistry::new()
            .with(CommandKind::Scan, Arc::new(Echo))
            .with(CommandKind::GenerateIac, Arc::new(Blocking))
            .with(CommandKind::Deploy, Arc::new(Failing("no target")));
        Dispatcher::new(ClientConfig::defaults(Profile::Dev), handlers).unwrap()
    }

    #[tokio::test]
    async fn local_run_streams_progress_then_result() {
        let dispatcher = dispatcher();
        let mut execution = dispatcher
            .execute(
                CommandKind::Scan,
                CommandRequest::new("acme", json!({ "regions": ["eu"] })),
                None,
                CancellationFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(execution.mode, ExecutionMode::Local);

        let progress: Vec<ProgressMessage> = execution.take_progress().unwrap().collect().await;
        let sequences: Vec<u64> = progress.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, [1, 2, 3]);
        assert!(progress[2].is_completion());

        let result = execution.wait().await.unwrap();
        assert_eq!(result.status, OperationStatus::Succeeded);
        assert_eq!(result.result, Some(json!({ "echo": { "regions": ["eu"] } })));
        assert_eq!(dispatcher.stats().snapshot(ExecutionMode::Local).invocations, 1);
    }

    #[tokio::test]
    async fn local_cancel_and_failure_are_terminal_states() {
        let dispatcher = dispatcher();
        let execution = dispatcher
            .execute(CommandKind::GenerateIac, CommandRequest::new("acme", json!({})), None, CancellationFlag::new())
            .await
            .unwrap();
        execution.cancel();
        assert_eq!(execution.wait().await.unwrap().status, OperationStatus::Cancelled);

        let execution = dispatcher
            .execute(CommandKind::Deploy, CommandRequest::new("acme", json!({})), None, CancellationFlag::new())
            .await
            .unwrap();
        let result = execution.wait().await.unwrap();
        assert_eq!(result.status, OperationStatus::Failed);
        assert!(result.error.unwrap().contains("no target"));

        let stats = dispatcher.stats().snapshot(ExecutionMode::Local);
        assert_eq!((stats.invocations, stats.failures), (2, 2));
    }

    #[tokio::test]
    async fn early_errors_are_returned_from_execute() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .execute(CommandKind::GenerateSpec, CommandRequest::new("acme", json!({})), None, CancellationFlag::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Unsupported(_)));

        let err = dispatcher
            .execute(CommandKind::Scan, CommandRequest::new("", json!({})), None, CancellationFlag::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Validation(_)));

        // No server configured.
        let err = dispatcher
            .execute(
                CommandKind::Scan,
                CommandRequest::new("acme", json!({})),
                Some(ExecutionMode::Remote),
                CancellationFlag::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Config(ConfigError::Missing("server_url"))));
    }
}
