//! Command handlers shared by unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::AppError,
    execution::{CommandHandler, HandlerContext},
};

/// Emits one info and one progress message, then returns `{"echo": params}`.
pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn execute(&self, ctx: &HandlerContext) -> Result<Value, AppError> {
        ctx.progress.info(format!("{} started", ctx.kind)).await;
        ctx.progress.progress(50, "halfway").await;
        Ok(json!({ "echo": ctx.params }))
    }
}

/// Waits until cancelled.
pub struct Blocking;

#[async_trait]
impl CommandHandler for Blocking {
    async fn execute(&self, ctx: &HandlerContext) -> Result<Value, AppError> {
        ctx.progress.info("waiting for cancellation").await;
        ctx.cancel.cancelled().await;
        ctx.checkpoint()?;
        Ok(Value::Null)
    }
}

/// Always fails with the given message.
pub struct Failing(pub &'static str);

#[async_trait]
impl CommandHandler for Failing {
    async fn execute(&self, _ctx: &HandlerContext) -> Result<Value, AppError> {
        Err(AppError::CommandFailed(self.0.to_string()))
    }
}
