//! Command handler that runs an external program.
//!
//! The program receives the request parameters as JSON on stdin and the
//! operation identity in `SCANRELAY_*` environment variables. Each stdout
//! line becomes a progress message:
//!
//! ```text
//! PROGRESS 40 scanning subnets     -> progress, 40%
//! RESULT {"resources": 12}         -> result document
//! anything else                    -> info
//! ```
//!
//! Stderr lines are forwarded as warnings. A non-zero exit fails the command.
//! Output that is not valid UTF-8 is decoded lossily; both pipes are drained
//! until the program closes them.

use std::{io, process::Stdio};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    execution::{CommandHandler, HandlerContext},
};

#[derive(Debug, Clone)]
pub struct ProcessHandler {
    program: String,
    args: Vec<String>,
}

enum StdoutLine {
    Progress(u8, String),
    Result(Value),
    Info(String),
}

/// Newline-delimited reader that never rejects a line for its encoding.
///
/// `next_line` can be dropped mid-read inside `select!`: partial bytes stay in
/// `buf` and the next call continues from them.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

fn parse_line(line: &str) -> StdoutLine {
    if let Some(rest) = line.strip_prefix("PROGRESS ") {
        let (percent, message) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Ok(percent) = percent.parse::<u8>() {
            return StdoutLine::Progress(percent.min(100), message.to_string());
        }
    }
    if let Some(rest) = line.strip_prefix("RESULT ") {
        if let Ok(value) = serde_json::from_str(rest) {
            return StdoutLine::Result(value);
        }
    }
    StdoutLine::Info(line.to_string())
}

impl ProcessHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a configured command line on whitespace. `None` if it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }
}

#[async_trait]
impl CommandHandler for ProcessHandler {
    async fn execute(&self, ctx: &HandlerContext) -> Result<Value, AppError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SCANRELAY_OPERATION_ID", ctx.operation_id.to_string())
            .env("SCANRELAY_TENANT_ID", &ctx.tenant_id)
            .env("SCANRELAY_COMMAND", ctx.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AppError::CommandFailed(format!("failed to start {}: {err}", self.program)))?;
        debug!(operation_id = %ctx.operation_id, program = %self.program, "command process started");

        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(&ctx.params).map_err(anyhow::Error::from)?;
            // A program that ignores stdin may close it early.
            if let Err(err) = stdin.write_all(&input).await {
                debug!(error = %err, "command closed stdin");
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stderr not captured"))?;
        let mut stdout = LossyLines::new(stdout);
        let mut stderr = LossyLines::new(stderr);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut result = None;
        let cancellable = ctx.kind.supports_cancellation();

        while stdout_open || stderr_open {
            tokio::select! {
                _ = ctx.cancel.cancelled(), if cancellable => {
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill cancelled command");
                    }
                    return Err(AppError::Cancelled);
                }
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        StdoutLine::Progress(percent, message) => {
                            ctx.progress.progress(percent, message).await;
                        }
                        StdoutLine::Result(value) => result = Some(value),
                        StdoutLine::Info(message) => {
                            ctx.progress.info(message).await;
                        }
                    },
                    Ok(None) => stdout_open = false,
                    Err(err) => {
                        warn!(error = %err, "reading command stdout failed");
                        stdout_open = false;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        ctx.progress.warning(line).await;
                    }
                    Ok(None) => stderr_open = false,
                    Err(err) => {
                        warn!(error = %err, "reading command stderr failed");
                        stderr_open = false;
                    }
                },
            }
        }

        let status = child.wait().await.map_err(anyhow::Error::from)?;
        if status.success() {
            Ok(result.unwrap_or_else(|| json!({})))
        } else {
            Err(AppError::CommandFailed(format!("{} exited with {status}", self.program)))
        }
    }
}
