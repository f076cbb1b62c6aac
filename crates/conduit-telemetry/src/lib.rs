//! Conduit Telemetry - logging setup for the plugin execution engine.
//!
//! Every conduit crate logs through `tracing` with structured fields
//! (`unit_id`, `task_id`, `resource`). This crate installs the global
//! subscriber that renders those events.
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), conduit_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("conduit_engine=debug");
//!
//! let _guard = setup_logging(&config)?;
//! tracing::info!("engine starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
pub use tracing_appender::non_blocking::WorkerGuard;
