//! Conversions from configuration sections to component settings.

use std::time::Duration;

use conduit_config::{
    CircuitBreakerSection, Config, EngineSection, LoggingSection, RateLimitSection, RetrySection,
    TasksSection,
};
use conduit_resilience::{CircuitBreakerConfig, RateLimitPolicy, RetryConfig};
use conduit_telemetry::{LogConfig, LogFormat, TelemetryResult};

use crate::engine::EngineSettings;

/// Breaker thresholds from the `[circuit_breaker]` section.
#[must_use]
pub fn breaker_config(section: &CircuitBreakerSection) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(section.failure_threshold)
        .with_failure_rate(
            section.failure_rate_threshold,
            section.minimum_requests_for_rate,
        )
        .with_open_timeout(Duration::from_millis(section.open_timeout_ms))
        .with_half_open(
            section.half_open_trial_count,
            section.success_threshold_to_close,
        )
}

/// Default rate-limit policy from the `[rate_limit]` section.
#[must_use]
pub fn rate_limit_policy(section: &RateLimitSection) -> RateLimitPolicy {
    RateLimitPolicy::new(section.max_requests, Duration::from_millis(section.window_ms))
}

/// Backoff settings from the `[retry]` section.
#[must_use]
pub fn retry_config(section: &RetrySection) -> RetryConfig {
    RetryConfig::new(
        section.max_attempts,
        Duration::from_millis(section.initial_delay_ms),
        Duration::from_millis(section.max_delay_ms),
        section.backoff_multiplier,
    )
    .with_jitter(section.jitter_ratio)
}

/// Tracker default timeout from the `[tasks]` section. `0` disables it.
#[must_use]
pub fn task_default_timeout(section: &TasksSection) -> Option<Duration> {
    (section.default_timeout_ms > 0).then(|| Duration::from_millis(section.default_timeout_ms))
}

/// Engine settings from a full configuration.
#[must_use]
pub fn engine_settings(config: &Config) -> EngineSettings {
    let EngineSection {
        unit_timeout_ms,
        health_timeout_ms,
        pin_status_on_error,
        shutdown_grace_ms,
    } = config.engine.clone();

    EngineSettings {
        unit_timeout: Duration::from_millis(unit_timeout_ms),
        health_timeout: Duration::from_millis(health_timeout_ms),
        pin_status_on_error,
        shutdown_grace: Duration::from_millis(shutdown_grace_ms),
        rate_limit: rate_limit_policy(&config.rate_limit),
        retry: retry_config(&config.retry),
    }
}

/// Logging setup from the `[logging]` section.
///
/// # Errors
///
/// Fails when the format name is unknown.
pub fn log_config(section: &LoggingSection) -> TelemetryResult<LogConfig> {
    let format: LogFormat = section.format.parse()?;
    Ok(LogConfig::new(section.level.clone())
        .with_format(format)
        .with_directives(section.directives.iter().cloned()))
}
