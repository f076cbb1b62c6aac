//! Task and tool error types.

use crate::task::TaskId;

/// Errors from the tool table and the task tracker.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// No tool is registered under this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A tool with this name is already registered.
    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    /// Tool names must be non-empty.
    #[error("invalid tool name: {0:?}")]
    InvalidToolName(String),

    /// No task with this id is tracked.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The task did not finish within the caller's wait.
    #[error("task {task_id} still running after {waited_ms}ms")]
    AwaitTimeout {
        /// Task being waited on.
        task_id: TaskId,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The tracker no longer accepts work.
    #[error("task tracker is shutting down")]
    ShuttingDown,

    /// `call_async` was invoked outside a Tokio runtime.
    #[error("no tokio runtime available to run the task")]
    NoRuntime,
}

/// Result type for tracker operations.
pub type TasksResult<T> = Result<T, TaskError>;

/// Error returned by a tool's `execute`.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The input does not match what the tool expects.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),

    /// The tool observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// Result type for tool execution.
pub type ToolResult = Result<serde_json::Value, ToolError>;
