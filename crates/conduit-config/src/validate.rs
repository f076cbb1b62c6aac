//! Range and cross-field checks on a fully merged [`Config`].

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 4] = ["pretty", "compact", "json", "full"];

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_engine(config)?;
    validate_circuit_breaker(config)?;
    validate_rate_limit(config)?;
    validate_retry(config)?;
    validate_logging(config)?;

    if config.events.channel_capacity == 0 {
        return Err(invalid(
            "events.channel_capacity",
            "channel_capacity must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_engine(config: &Config) -> ConfigResult<()> {
    if config.engine.unit_timeout_ms == 0 {
        return Err(invalid(
            "engine.unit_timeout_ms",
            "unit_timeout_ms must be greater than 0",
        ));
    }
    if config.engine.health_timeout_ms == 0 {
        return Err(invalid(
            "engine.health_timeout_ms",
            "health_timeout_ms must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_circuit_breaker(config: &Config) -> ConfigResult<()> {
    let cb = &config.circuit_breaker;

    if cb.failure_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.failure_threshold",
            "failure_threshold must be greater than 0",
        ));
    }
    if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 1.0) {
        return Err(invalid(
            "circuit_breaker.failure_rate_threshold",
            format!(
                "failure_rate_threshold {} must be in (0.0, 1.0]",
                cb.failure_rate_threshold
            ),
        ));
    }
    if cb.half_open_trial_count == 0 {
        return Err(invalid(
            "circuit_breaker.half_open_trial_count",
            "half_open_trial_count must be greater than 0",
        ));
    }
    let close = cb.success_threshold_to_close;
    if close == 0 || close > cb.half_open_trial_count {
        return Err(invalid(
            "circuit_breaker.success_threshold_to_close",
            format!(
                "success_threshold_to_close must be between 1 and half_open_trial_count ({})",
                cb.half_open_trial_count
            ),
        ));
    }
    Ok(())
}

fn validate_rate_limit(config: &Config) -> ConfigResult<()> {
    if config.rate_limit.window_ms == 0 {
        return Err(invalid(
            "rate_limit.window_ms",
            "window_ms must be greater than 0",
        ));
    }
    if config.rate_limit.max_requests == 0 {
        return Err(invalid(
            "rate_limit.max_requests",
            "max_requests must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_retry(config: &Config) -> ConfigResult<()> {
    let r = &config.retry;

    if r.max_attempts == 0 {
        return Err(invalid(
            "retry.max_attempts",
            "max_attempts must be greater than 0",
        ));
    }
    if r.initial_delay_ms > r.max_delay_ms {
        return Err(invalid(
            "retry.initial_delay_ms",
            "initial_delay_ms must not exceed max_delay_ms",
        ));
    }
    if !r.backoff_multiplier.is_finite() || r.backoff_multiplier < 1.0 {
        return Err(invalid(
            "retry.backoff_multiplier",
            "backoff_multiplier must be a finite number >= 1.0",
        ));
    }
    if !(0.0..=1.0).contains(&r.jitter_ratio) {
        return Err(invalid(
            "retry.jitter_ratio",
            format!("jitter_ratio {} must be between 0.0 and 1.0", r.jitter_ratio),
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let level = config.logging.level.to_ascii_lowercase();
    if !VALID_LEVELS.contains(&level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                VALID_LEVELS.join(", ")
            ),
        ));
    }

    let format = config.logging.format.to_ascii_lowercase();
    if !VALID_FORMATS.contains(&format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                VALID_FORMATS.join(", ")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_close_threshold_above_trial_count() {
        let mut config = Config::default();
        config.circuit_breaker.half_open_trial_count = 2;
        config.circuit_breaker.success_threshold_to_close = 3;

        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "circuit_breaker.success_threshold_to_close"
        );
    }

    #[test]
    fn test_failure_rate_out_of_range() {
        let mut config = Config::default();
        config.circuit_breaker.failure_rate_threshold = 0.0;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "circuit_breaker.failure_rate_threshold"
        );

        config.circuit_breaker.failure_rate_threshold = 1.0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_jitter_ratio_bounds() {
        let mut config = Config::default();
        config.retry.jitter_ratio = 1.5;
        assert_eq!(field_of(validate(&config).unwrap_err()), "retry.jitter_ratio");
    }

    #[test]
    fn test_unknown_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.format");
    }
}
