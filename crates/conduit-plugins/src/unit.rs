//! Unit identity, kind, descriptor, status and the [`PluginUnit`] trait.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::contribution::Contribution;
use crate::error::{PluginError, PluginResult, UnitResult};

/// Unique, stable unit identifier.
///
/// Ids are non-empty and contain only lowercase ASCII letters, digits,
/// `-`, `_` and `.`. The `:` separator is reserved for derived names such
/// as the `unit:<id>` tool names used for background dispatch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UnitId(String);

impl<'de> Deserialize<'de> for UnitId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl UnitId {
    /// Create a validated id.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the id is empty or contains a
    /// character outside the allowed set.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    /// Create an id from a literal.
    ///
    /// Runtime input goes through [`UnitId::new`]. Debug builds still check
    /// the literal and panic on a malformed one.
    #[must_use]
    pub fn from_static(id: &'static str) -> Self {
        debug_assert!(validate(id).is_ok(), "invalid unit id literal '{id}'");
        Self(id.to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(id: &str) -> PluginResult<()> {
    if id.is_empty() {
        return Err(PluginError::InvalidId("unit id must not be empty".into()));
    }
    if let Some(bad) = id.chars().find(|c| {
        !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    }) {
        return Err(PluginError::InvalidId(format!(
            "unit id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Category of a unit. Decides which pipeline stage invokes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Contributes declarations only; never executed.
    Static,
    /// Rewrites the input or chain state before other units run.
    MessagePreprocessor,
    /// Runs inline; its result is part of the run's response.
    Synchronous,
    /// Dispatched to the background task tracker.
    Asynchronous,
    /// Long-running service with a health probe; never executed in a run.
    Service,
    /// Service that also executes, inline or in the background per its
    /// [`HybridMode`].
    HybridService,
}

impl UnitKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Static,
        Self::MessagePreprocessor,
        Self::Synchronous,
        Self::Asynchronous,
        Self::Service,
        Self::HybridService,
    ];

    /// Whether units of this kind run a background service loop.
    #[must_use]
    pub fn is_service(self) -> bool {
        matches!(self, Self::Service | Self::HybridService)
    }

    /// Snake-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::MessagePreprocessor => "message_preprocessor",
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
            Self::Service => "service",
            Self::HybridService => "hybrid_service",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage selection for [`UnitKind::HybridService`] units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridMode {
    /// Run inline with synchronous units.
    #[default]
    Sync,
    /// Dispatch to the background with asynchronous units.
    Async,
}

/// Static description of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    /// Unique id.
    pub id: UnitId,
    /// Display name.
    pub name: String,
    /// Version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Kind.
    pub kind: UnitKind,
    /// Units that must be registered and active for this one to run.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<UnitId>,
    /// User intent. A disabled unit is never selected.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher runs first within a stage.
    #[serde(default)]
    pub priority: i32,
    /// Opaque settings, replaced by reconfiguration.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Capabilities the unit adds to the system.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<Contribution>,
    /// Stage for hybrid services.
    #[serde(default)]
    pub hybrid_mode: HybridMode,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl UnitDescriptor {
    /// Create an enabled descriptor with priority 0.
    #[must_use]
    pub fn new(id: UnitId, name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            id,
            name: name.into(),
            version: default_version(),
            kind,
            dependencies: BTreeSet::new(),
            enabled: true,
            priority: 0,
            config: Map::new(),
            contributions: Vec::new(),
            hybrid_mode: HybridMode::default(),
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: UnitId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Mark the unit disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Set one config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Declare a contribution.
    #[must_use]
    pub fn with_contribution(mut self, contribution: Contribution) -> Self {
        self.contributions.push(contribution);
        self
    }

    /// Set the hybrid stage.
    #[must_use]
    pub fn with_hybrid_mode(mut self, mode: HybridMode) -> Self {
        self.hybrid_mode = mode;
        self
    }

    /// Whether the unit runs in the inline stage (synchronous, or hybrid
    /// in sync mode).
    #[must_use]
    pub fn runs_inline(&self) -> bool {
        match self.kind {
            UnitKind::Synchronous => true,
            UnitKind::HybridService => self.hybrid_mode == HybridMode::Sync,
            _ => false,
        }
    }

    /// Whether the unit is dispatched in the background stage.
    #[must_use]
    pub fn runs_in_background(&self) -> bool {
        match self.kind {
            UnitKind::Asynchronous => true,
            UnitKind::HybridService => self.hybrid_mode == HybridMode::Async,
            _ => false,
        }
    }
}

/// Observed runtime status of a registered unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum PluginStatus {
    /// Registered but switched off by the user.
    Disabled,
    /// Initialization in progress.
    Loading,
    /// Eligible for execution.
    Active,
    /// Initialization or execution failed; stays until reset.
    Error(String),
    /// Shutdown in progress.
    Unloading,
}

impl PluginStatus {
    /// Whether the unit may be selected for execution.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Snake-case label without the error detail.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Error(_) => "error",
            Self::Unloading => "unloading",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "error: {msg}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of a service health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthStatus {
    /// Healthy, no message.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    /// Unhealthy with a reason.
    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

impl fmt::Debug for dyn PluginUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.descriptor();
        f.debug_struct("PluginUnit")
            .field("id", &d.id)
            .field("kind", &d.kind)
            .field("priority", &d.priority)
            .finish_non_exhaustive()
    }
}

/// Behaviour of a registered unit.
///
/// Only [`execute`](Self::execute) is required. Lifecycle hooks default to
/// no-ops. Hooks take `&self`: the registry shares units behind `Arc` and
/// calls hooks without holding its own locks.
#[async_trait]
pub trait PluginUnit: Send + Sync {
    /// Static description of the unit.
    fn descriptor(&self) -> &UnitDescriptor;

    /// Called once at registration, and again on reset.
    async fn init(&self) -> UnitResult<()> {
        Ok(())
    }

    /// Called before the unit is removed from the registry.
    async fn shutdown(&self) -> UnitResult<()> {
        Ok(())
    }

    /// Run the unit against a request context. Preprocessors may mutate
    /// `ctx.input` and `ctx.chain_state`; the returned value is recorded as
    /// the unit's output.
    async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>>;

    /// Start the background service loop of a service unit.
    async fn start_service(&self) -> UnitResult<()> {
        Ok(())
    }

    /// Stop the background service loop of a service unit.
    async fn stop_service(&self) -> UnitResult<()> {
        Ok(())
    }

    /// Health probe for service units.
    async fn health(&self) -> UnitResult<HealthStatus> {
        Ok(HealthStatus::healthy())
    }

    /// Accept or reject new settings. On success the registry replaces the
    /// descriptor's `config`.
    async fn reconfigure(&self, _settings: &Map<String, Value>) -> UnitResult<()> {
        Ok(())
    }
}
