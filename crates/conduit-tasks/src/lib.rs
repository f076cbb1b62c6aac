//! Conduit Tasks - background execution of named tools.
//!
//! Tools implement [`TaskTool`] and are registered by name in a
//! [`ToolTable`]. The [`AsyncTaskTracker`] dispatches a tool call to the
//! Tokio runtime, returns a [`TaskId`] immediately, and tracks the call
//! through `Pending -> Running -> {Completed | Failed | TimedOut}`.
//!
//! # Example
//!
//! ```rust
//! use conduit_tasks::{AsyncTaskTracker, TaskConfig, TaskStatus, ToolTable};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let tracker = AsyncTaskTracker::new(Arc::new(ToolTable::with_builtins()));
//! let id = tracker
//!     .call_async("echo", json!("hi"), Default::default(), TaskConfig::default())
//!     .unwrap();
//!
//! let task = tracker
//!     .await_completion(id, Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(task.status, TaskStatus::Completed);
//! assert_eq!(task.result, Some(json!("hi")));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod builtin;
pub mod error;
pub mod task;
pub mod tool;
pub mod tracker;

pub use builtin::{DelayTool, EchoTool};
pub use error::{TaskError, TasksResult, ToolError, ToolResult};
pub use task::{AsyncTask, TaskConfig, TaskId, TaskStatus};
pub use tool::{TaskTool, ToolContext, ToolTable};
pub use tracker::{AsyncTaskTracker, DEFAULT_START_HOLD, DrainReport};
