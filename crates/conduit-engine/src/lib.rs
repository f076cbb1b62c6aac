//! Conduit Engine - staged execution of plugin units.
//!
//! The [`PluginExecutionEngine`] owns a [`PluginRegistry`] and an
//! [`AsyncTaskTracker`]. Each call to
//! [`run_chain`](PluginExecutionEngine::run_chain) selects the runnable
//! units and runs them in three stages:
//!
//! 1. message preprocessors, sequentially, by descending priority;
//! 2. synchronous units (and hybrid services in sync mode), sequentially;
//! 3. asynchronous units (and hybrid services in async mode), dispatched to
//!    the tracker without waiting.
//!
//! Every invocation passes through a per-unit [`CircuitBreaker`] and a
//! timeout. A failing, hanging or panicking unit becomes a failed
//! [`ExecutionResult`] and never takes the run down with it.
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_engine::{ChainOptions, PluginExecutionEngine};
//! use conduit_plugins::ExecutionContext;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), conduit_engine::EngineError> {
//! let engine = PluginExecutionEngine::new();
//! // engine.register_unit(...).await?;
//!
//! let mut ctx = ExecutionContext::new(json!({"text": "hello"}));
//! let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await?;
//! println!("success: {}", outcome.overall_success);
//! # Ok(())
//! # }
//! ```
//!
//! [`PluginRegistry`]: conduit_plugins::PluginRegistry
//! [`AsyncTaskTracker`]: conduit_tasks::AsyncTaskTracker
//! [`CircuitBreaker`]: conduit_resilience::CircuitBreaker
//! [`ExecutionResult`]: conduit_plugins::ExecutionResult

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod chain;
pub mod config_bridge;
pub mod engine;
pub mod error;
mod invoke;
pub mod report;

pub use chain::{ASYNC_TASKS_KEY, AggregateResult, ChainOptions, SkipReason};
pub use engine::{EngineBuilder, EngineSettings, PluginExecutionEngine};
pub use error::{EngineError, EngineResult};
pub use invoke::{UNIT_TOOL_PREFIX, unit_tool_name};
pub use report::{EngineStats, HealthReport, ShutdownReport};
