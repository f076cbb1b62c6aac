//! Tool trait and the name-keyed tool table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builtin::{DelayTool, EchoTool};
use crate::error::{TaskError, TasksResult, ToolResult};
use crate::task::TaskId;

/// A named operation the tracker can run in the background.
#[async_trait]
pub trait TaskTool: Send + Sync {
    /// Unique name used for dispatch.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Run the tool. Long-running tools should watch
    /// [`ToolContext::cancellation`] and stop early when it fires.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// Per-task context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Task being executed.
    pub task_id: TaskId,
    /// Correlation group of the task.
    pub correlation_id: String,
    /// Caller-supplied context.
    pub context: Map<String, Value>,
    /// Fired when the task is cancelled.
    pub cancellation: CancellationToken,
}

impl ToolContext {
    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Tools available for background dispatch, keyed by name.
///
/// Names are validated at registration so that dispatch can fail fast on an
/// unknown name.
#[derive(Default)]
pub struct ToolTable {
    tools: RwLock<HashMap<String, Arc<dyn TaskTool>>>,
}

impl fmt::Debug for ToolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolTable")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding the built-in `echo` and `delay` tools.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut tools: HashMap<String, Arc<dyn TaskTool>> = HashMap::new();
        tools.insert(EchoTool::NAME.to_string(), Arc::new(EchoTool));
        tools.insert(DelayTool::NAME.to_string(), Arc::new(DelayTool));
        Self {
            tools: RwLock::new(tools),
        }
    }

    /// Register a tool under its own name.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidToolName`] for an empty or blank name,
    /// [`TaskError::DuplicateTool`] if the name is taken.
    pub fn register(&self, tool: Arc<dyn TaskTool>) -> TasksResult<()> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(TaskError::InvalidToolName(name));
        }
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&name) {
            return Err(TaskError::DuplicateTool(name));
        }
        debug!(tool = %name, "Registered task tool");
        tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Look up a tool.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether a tool is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl TaskTool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
            Ok(input)
        }
    }

    #[test]
    fn test_builtins_present() {
        let table = ToolTable::with_builtins();
        assert_eq!(table.names(), ["delay", "echo"]);
        assert!(table.get("echo").is_some());
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn test_register_rejects_duplicates_and_blank_names() {
        let table = ToolTable::with_builtins();
        assert!(matches!(
            table.register(Arc::new(Named("echo"))),
            Err(TaskError::DuplicateTool(_))
        ));
        assert!(matches!(
            table.register(Arc::new(Named("  "))),
            Err(TaskError::InvalidToolName(_))
        ));
        table.register(Arc::new(Named("custom"))).unwrap();
        assert!(table.contains("custom"));
        assert!(table.unregister("custom"));
        assert!(!table.unregister("custom"));
    }
}
