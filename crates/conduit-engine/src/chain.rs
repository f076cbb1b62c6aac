//! Run options and aggregate outcome of a chain run.

use conduit_plugins::{ExecutionResult, UnitId, UnitKind};
use conduit_tasks::TaskId;
use serde::Serialize;
use serde_json::{Map, Value};

/// Metadata key listing background dispatches as `{unit_id: task_id}`.
pub const ASYNC_TASKS_KEY: &str = "asyncTasks";

/// Options for [`PluginExecutionEngine::run_chain`].
///
/// [`PluginExecutionEngine::run_chain`]: crate::PluginExecutionEngine::run_chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainOptions {
    /// Kinds eligible for this run. `None` means every kind.
    pub target_kinds: Option<Vec<UnitKind>>,
    /// Stop after the first inline failure.
    pub fail_fast: bool,
}

impl ChainOptions {
    /// Restrict the run to `kinds`.
    #[must_use]
    pub fn only(kinds: impl IntoIterator<Item = UnitKind>) -> Self {
        Self {
            target_kinds: Some(kinds.into_iter().collect()),
            fail_fast: false,
        }
    }

    /// Stop at the first inline failure.
    #[must_use]
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub(crate) fn includes(&self, kind: UnitKind) -> bool {
        self.target_kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Why a selected unit was not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Declared dependencies that are missing or not active.
    UnmetDependencies(Vec<UnitId>),
    /// An earlier inline unit failed and the run was fail-fast.
    FailFast,
    /// Background dispatch was refused.
    DispatchFailed(String),
}

/// Everything one chain run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Whether every attempted inline unit succeeded.
    pub overall_success: bool,
    /// Inline results in execution order.
    pub per_unit_results: Vec<(UnitId, ExecutionResult)>,
    /// Background dispatches in dispatch order.
    pub async_tasks: Vec<(UnitId, TaskId)>,
    /// Units selected but not run.
    pub skipped: Vec<(UnitId, SkipReason)>,
    /// Run metadata, including [`ASYNC_TASKS_KEY`].
    pub metadata: Map<String, Value>,
}

impl AggregateResult {
    /// Result recorded for `id`, if it ran inline.
    #[must_use]
    pub fn result_for(&self, id: &UnitId) -> Option<&ExecutionResult> {
        self.per_unit_results
            .iter()
            .find(|(unit, _)| unit == id)
            .map(|(_, result)| result)
    }

    /// Task dispatched for `id`, if any.
    #[must_use]
    pub fn task_for(&self, id: &UnitId) -> Option<TaskId> {
        self.async_tasks
            .iter()
            .find(|(unit, _)| unit == id)
            .map(|(_, task)| *task)
    }

    /// Skip reason for `id`, if it was skipped.
    #[must_use]
    pub fn skip_reason(&self, id: &UnitId) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|(unit, _)| unit == id)
            .map(|(_, reason)| reason)
    }
}
