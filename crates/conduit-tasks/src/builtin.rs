//! Built-in tools.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ToolError, ToolResult};
use crate::tool::{TaskTool, ToolContext};

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTool;

impl EchoTool {
    /// Dispatch name.
    pub const NAME: &'static str = "echo";
}

#[async_trait]
impl TaskTool for EchoTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Return the input unchanged"
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        Ok(input)
    }
}

/// Sleeps for `input.ms` milliseconds, then returns `input.value`.
///
/// Stops early with [`ToolError::Cancelled`] when the task is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayTool;

impl DelayTool {
    /// Dispatch name.
    pub const NAME: &'static str = "delay";
}

#[async_trait]
impl TaskTool for DelayTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Wait for `ms` milliseconds, then return `value`"
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let ms = input
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::InvalidInput("expected a non-negative integer `ms`".into()))?;
        let value = input.get("value").cloned().unwrap_or(Value::Null);

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(value),
            () = ctx.cancellation.cancelled() => Err(ToolError::Cancelled),
        }
    }
}
