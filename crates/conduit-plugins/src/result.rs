//! Outcome of a chain run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of one chain run. Never represents a panic; failures are data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether every selected unit succeeded.
    pub success: bool,
    /// Wall-clock duration of the run.
    pub elapsed_ms: u64,
    /// Combined unit outputs, keyed by unit id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// First error message when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-run details such as `asyncTasks` and per-unit outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ExecutionResult {
    /// Successful run.
    #[must_use]
    pub fn success(elapsed_ms: u64, output: Option<Value>) -> Self {
        Self {
            success: true,
            elapsed_ms,
            output,
            error: None,
            metadata: None,
        }
    }

    /// Failed run.
    #[must_use]
    pub fn failure(elapsed_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            elapsed_ms,
            output: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach output.
    #[must_use]
    pub fn with_output(mut self, output: Option<Value>) -> Self {
        self.output = output;
        self
    }
}
