//! Guarded unit invocation and the background tool adapter.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_plugins::{
    ExecutionContext, ExecutionResult, PluginRegistry, PluginUnit, UnitError, UnitId,
};
use conduit_resilience::{BreakerError, CircuitBreaker};
use conduit_tasks::{TaskTool, ToolContext, ToolError, ToolResult};
use serde_json::Value;
use tracing::{debug, warn};

/// Prefix of the tool names under which background units are dispatched.
pub const UNIT_TOOL_PREFIX: &str = "unit:";

/// Tool name for a unit's background dispatch.
#[must_use]
pub fn unit_tool_name(id: &UnitId) -> String {
    format!("{UNIT_TOOL_PREFIX}{id}")
}

#[derive(Debug, thiserror::Error)]
enum InvokeError {
    #[error(transparent)]
    Unit(UnitError),
    #[error("timed out after {0}ms")]
    Timeout(u128),
    #[error("unit panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs one unit under the circuit breaker, a timeout and panic isolation.
#[derive(Debug)]
pub(crate) struct Invoker {
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) timeout: Duration,
    pub(crate) pin_status_on_error: bool,
}

impl Invoker {
    /// Execute `unit` against `ctx`.
    ///
    /// The unit runs on a clone of the context in its own task. On success
    /// the clone replaces `ctx` and the output is recorded under the unit's
    /// id; on any failure `ctx` is left exactly as it was.
    pub(crate) async fn invoke(
        &self,
        unit: Arc<dyn PluginUnit>,
        ctx: &mut ExecutionContext,
    ) -> ExecutionResult {
        let id = unit.descriptor().id.clone();
        let start = Instant::now();
        let working = ctx.clone();
        let timeout = self.timeout;

        let outcome = self
            .breaker
            .execute(id.as_str(), move || async move {
                let handle = tokio::spawn(async move {
                    let mut working = working;
                    let result = unit.execute(&mut working).await;
                    (result, working)
                });
                let abort = handle.abort_handle();
                match tokio::time::timeout(timeout, handle).await {
                    Err(_) => {
                        abort.abort();
                        Err(InvokeError::Timeout(timeout.as_millis()))
                    },
                    Ok(Err(join)) if join.is_panic() => {
                        Err(InvokeError::Panicked(panic_message(join.into_panic().as_ref())))
                    },
                    Ok(Err(join)) => Err(InvokeError::Panicked(join.to_string())),
                    Ok(Ok((Err(e), _))) => Err(InvokeError::Unit(e)),
                    Ok(Ok((Ok(value), updated))) => Ok((value, updated)),
                }
            })
            .await;

        match outcome {
            Ok((value, updated)) => {
                *ctx = updated;
                if let Some(value) = &value {
                    ctx.record_output(&id, value.clone());
                }
                let elapsed = elapsed_ms(start);
                debug!(unit_id = %id, elapsed_ms = elapsed, "Unit succeeded");
                ExecutionResult::success(elapsed, value)
            },
            Err(BreakerError::Open { .. }) => {
                debug!(unit_id = %id, "Unit skipped by open circuit");
                ExecutionResult::failure(elapsed_ms(start), "circuit open")
            },
            Err(BreakerError::Inner(e)) => {
                let message = e.to_string();
                warn!(unit_id = %id, error = %message, "Unit failed");
                if self.pin_status_on_error {
                    self.registry.mark_error(&id, message.clone());
                }
                ExecutionResult::failure(elapsed_ms(start), message)
            },
        }
    }
}

/// Exposes a registered unit as a background tool named `unit:<id>`.
///
/// The task input is a context snapshot. The unit is looked up at run time,
/// so a re-registered unit is picked up by later dispatches.
pub(crate) struct UnitTool {
    name: String,
    unit_id: UnitId,
    invoker: Arc<Invoker>,
}

impl UnitTool {
    pub(crate) fn new(unit_id: UnitId, invoker: Arc<Invoker>) -> Self {
        Self {
            name: unit_tool_name(&unit_id),
            unit_id,
            invoker,
        }
    }
}

#[async_trait]
impl TaskTool for UnitTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Background execution of a plugin unit"
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        let unit = self
            .invoker
            .registry
            .get_unit(&self.unit_id)
            .ok_or_else(|| {
                ToolError::Execution(format!("unit {} is not registered", self.unit_id))
            })?;
        let mut context = ExecutionContext::from_snapshot(input)
            .map_err(|e| ToolError::InvalidInput(e.to_string()))?;

        let result = self.invoker.invoke(unit, &mut context).await;
        if result.success {
            Ok(result.output.unwrap_or(Value::Null))
        } else {
            Err(ToolError::Execution(
                result.error.unwrap_or_else(|| "unit failed".to_string()),
            ))
        }
    }
}
