//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::time::Duration;

use conduit_engine::{EngineSettings, PluginExecutionEngine};
use conduit_plugins::UnitId;
use conduit_test::init_test_logging;

/// Engine with a short unit timeout.
pub fn engine() -> PluginExecutionEngine {
    engine_with(settings())
}

/// Engine with custom settings.
pub fn engine_with(settings: EngineSettings) -> PluginExecutionEngine {
    init_test_logging();
    PluginExecutionEngine::builder()
        .with_settings(settings)
        .build()
}

/// Default settings with a one second unit timeout.
pub fn settings() -> EngineSettings {
    EngineSettings {
        unit_timeout: Duration::from_secs(1),
        ..EngineSettings::default()
    }
}

/// Settings that leave failing units active.
pub fn unpinned() -> EngineSettings {
    EngineSettings {
        pin_status_on_error: false,
        ..settings()
    }
}

pub fn id(s: &'static str) -> UnitId {
    UnitId::from_static(s)
}
