//! Event types published by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Groups events that belong to one logical request.
    pub correlation_id: Option<String>,
    /// Component that emitted the event.
    pub source: String,
}

impl EventMetadata {
    /// Create metadata for an event emitted by `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            source: source.into(),
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Lifecycle events observable from outside the engine.
///
/// Identifiers are carried as plain strings so that observers do not need
/// to depend on the plugin or task crates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConduitEvent {
    /// A unit was added to the registry.
    PluginRegistered {
        /// Event metadata.
        metadata: EventMetadata,
        /// Unit identifier.
        unit_id: String,
        /// Unit kind label.
        kind: String,
    },
    /// A unit was removed from the registry.
    PluginUnregistered {
        /// Event metadata.
        metadata: EventMetadata,
        /// Unit identifier.
        unit_id: String,
    },
    /// The observed runtime status of a unit changed.
    PluginStatusChanged {
        /// Event metadata.
        metadata: EventMetadata,
        /// Unit identifier.
        unit_id: String,
        /// New status label.
        status: String,
        /// Error detail when the new status is `error`.
        error: Option<String>,
    },
    /// A service unit's health probe result changed.
    PluginHealthChanged {
        /// Event metadata.
        metadata: EventMetadata,
        /// Unit identifier.
        unit_id: String,
        /// Whether the unit is now healthy.
        healthy: bool,
        /// Probe message, if any.
        message: Option<String>,
    },
    /// A background task moved to a new status.
    TaskStatusChanged {
        /// Event metadata.
        metadata: EventMetadata,
        /// Task identifier.
        task_id: Uuid,
        /// Tool the task runs.
        tool_name: String,
        /// Correlation group of the task.
        correlation_id: String,
        /// New status label.
        status: String,
    },
    /// A pipeline run finished.
    ChainCompleted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Request the run belonged to.
        request_id: Uuid,
        /// Whether every attempted synchronous unit succeeded.
        overall_success: bool,
        /// Number of units invoked inline.
        units_run: usize,
        /// Number of units dispatched to the background.
        async_dispatched: usize,
        /// Wall-clock duration of the run.
        duration_ms: u64,
    },
}

impl ConduitEvent {
    /// Stable snake-case name of the event variant.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PluginRegistered { .. } => "plugin_registered",
            Self::PluginUnregistered { .. } => "plugin_unregistered",
            Self::PluginStatusChanged { .. } => "plugin_status_changed",
            Self::PluginHealthChanged { .. } => "plugin_health_changed",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::ChainCompleted { .. } => "chain_completed",
        }
    }

    /// Metadata of the event.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::PluginRegistered { metadata, .. }
            | Self::PluginUnregistered { metadata, .. }
            | Self::PluginStatusChanged { metadata, .. }
            | Self::PluginHealthChanged { metadata, .. }
            | Self::TaskStatusChanged { metadata, .. }
            | Self::ChainCompleted { metadata, .. } => metadata,
        }
    }
}
