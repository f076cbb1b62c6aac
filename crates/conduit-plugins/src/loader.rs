//! Interface to the external sandboxed code loader.
//!
//! The engine never loads plugin code itself. A [`SandboxedLoader`] checks a
//! plugin source in isolation and reports a manifest; the registry only
//! consumes the outcome (see [`PluginRegistry::register_checked`]).
//!
//! [`PluginRegistry::register_checked`]: crate::PluginRegistry::register_checked

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Limits applied by the loader to one load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// Wall-clock limit for the load.
    pub timeout: Duration,
    /// Capabilities the loaded code may request.
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
    /// Memory ceiling in bytes, if any.
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            allowed_capabilities: Vec::new(),
            memory_limit_bytes: None,
        }
    }
}

impl LoaderOptions {
    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow a capability.
    #[must_use]
    pub fn allow(mut self, capability: impl Into<String>) -> Self {
        self.allowed_capabilities.push(capability.into());
        self
    }

    /// Set the memory ceiling.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }
}

/// What the loader reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    /// Whether the source loaded cleanly.
    pub success: bool,
    /// Manifest extracted from the source.
    #[serde(default)]
    pub manifest: Option<Value>,
    /// Time the load took.
    pub execution_time_ms: u64,
    /// Failure detail.
    #[serde(default)]
    pub error: Option<String>,
}

impl LoadOutcome {
    /// Successful load.
    #[must_use]
    pub fn loaded(manifest: Option<Value>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            manifest,
            execution_time_ms,
            error: None,
        }
    }

    /// Failed load.
    #[must_use]
    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            manifest: None,
            execution_time_ms,
            error: Some(error.into()),
        }
    }
}

/// Loads and vets plugin source in isolation.
#[async_trait]
pub trait SandboxedLoader: Send + Sync {
    /// Load `source` under `options`. Never panics; failures are reported
    /// in the outcome.
    async fn load(&self, source: &str, options: &LoaderOptions) -> LoadOutcome;
}
