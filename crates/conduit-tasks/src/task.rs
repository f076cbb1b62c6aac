//! Task data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stored, not yet started.
    Pending,
    /// The tool is executing.
    Running,
    /// The tool returned a value.
    Completed,
    /// The tool failed or the task was cancelled.
    Failed,
    /// The task exceeded its timeout.
    TimedOut,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Snake-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskConfig {
    /// Timeout in milliseconds. `None` uses the tracker default.
    pub timeout_ms: Option<u64>,
    /// Correlation group. `None` uses the task id.
    pub correlation_id: Option<String>,
}

impl TaskConfig {
    /// Set the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// One tracked tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncTask {
    /// Task id.
    pub id: TaskId,
    /// Name of the tool being run.
    pub tool_name: String,
    /// Input handed to the tool.
    pub input: Value,
    /// Caller context handed to the tool.
    pub context: Map<String, Value>,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was dispatched.
    pub created_at: DateTime<Utc>,
    /// When the tool started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal state was written.
    pub completed_at: Option<DateTime<Utc>>,
    /// Tool output, when completed.
    pub result: Option<Value>,
    /// Failure detail.
    pub error: Option<String>,
    /// Effective timeout.
    pub timeout_ms: Option<u64>,
    /// Correlation group.
    pub correlation_id: String,
}

impl AsyncTask {
    pub(crate) fn pending(
        id: TaskId,
        tool_name: &str,
        input: Value,
        context: Map<String, Value>,
        timeout_ms: Option<u64>,
        correlation_id: String,
    ) -> Self {
        Self {
            id,
            tool_name: tool_name.to_string(),
            input,
            context,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            timeout_ms,
            correlation_id,
        }
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time from dispatch to completion, if completed.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| done.signed_duration_since(self.created_at).num_milliseconds())
    }

    /// `Pending -> Running`. Returns false in any other state.
    pub(crate) fn start(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Write the terminal state. Returns false if already terminal.
    pub(crate) fn finish(
        &mut self,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}
