//! Health and statistics reports.

use std::collections::BTreeMap;

use conduit_plugins::{UnitId, UnitKind};
use conduit_tasks::DrainReport;
use serde::Serialize;

/// Health of one service unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Unit probed.
    pub unit_id: UnitId,
    /// Probe verdict. Errors and timeouts count as unhealthy.
    pub healthy: bool,
    /// Probe detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Registered units per kind.
    pub by_kind: BTreeMap<UnitKind, usize>,
    /// Registered units per status label.
    pub by_status: BTreeMap<String, usize>,
    /// Background tasks not yet terminal.
    pub pending_async_tasks: usize,
    /// Registered units.
    pub total_units: usize,
}

/// Outcome of [`PluginExecutionEngine::shutdown`].
///
/// [`PluginExecutionEngine::shutdown`]: crate::PluginExecutionEngine::shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// What happened to in-flight background tasks.
    pub tasks: DrainReport,
    /// Units unregistered.
    pub units_unregistered: usize,
}
