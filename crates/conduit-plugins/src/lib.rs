//! Conduit Plugins - typed, prioritized plugin units and their registry.
//!
//! A [`PluginUnit`] is a registered capability with a [`UnitKind`] that
//! decides which pipeline stage invokes it. The [`PluginRegistry`] owns
//! every unit, tracks its observed [`PluginStatus`] separately from the
//! user's `enabled` intent, and isolates lifecycle failures per unit.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use conduit_plugins::{
//!     ExecutionContext, PluginRegistry, PluginStatus, PluginUnit, UnitDescriptor, UnitId,
//!     UnitKind, UnitResult,
//! };
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! struct Upper(UnitDescriptor);
//!
//! #[async_trait]
//! impl PluginUnit for Upper {
//!     fn descriptor(&self) -> &UnitDescriptor {
//!         &self.0
//!     }
//!
//!     async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
//!         let text = ctx.input.as_str().unwrap_or_default().to_uppercase();
//!         Ok(Some(json!(text)))
//!     }
//! }
//!
//! # async fn example() {
//! let registry = PluginRegistry::new();
//! let descriptor = UnitDescriptor::new(
//!     UnitId::new("upper").unwrap(),
//!     "Upper",
//!     UnitKind::Synchronous,
//! );
//! let status = registry.register(Arc::new(Upper(descriptor))).await.unwrap();
//! assert_eq!(status, PluginStatus::Active);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod context;
pub mod contribution;
pub mod error;
pub mod loader;
pub mod registry;
pub mod result;
pub mod unit;

pub use context::{ChainState, ExecutionContext};
pub use contribution::{Contribution, ContributionType};
pub use error::{PluginError, PluginResult, UnitError, UnitResult};
pub use loader::{LoadOutcome, LoaderOptions, SandboxedLoader};
pub use registry::{MANIFEST_CONTEXT_KEY, PluginRegistry, RegisteredUnit};
pub use result::ExecutionResult;
pub use unit::{
    HealthStatus, HybridMode, PluginStatus, PluginUnit, UnitDescriptor, UnitId, UnitKind,
};
