//! `CONDUIT_*` environment variables are a fallback: they only fill fields
//! that no config file set.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::FileSetFields;

/// Prefix shared by every recognised variable.
pub const ENV_PREFIX: &str = "CONDUIT_";

#[derive(Clone, Copy)]
enum ValueKind {
    Integer,
    Float,
    Bool,
    Text,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: ValueKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "CONDUIT_LOG_LEVEL",
        field_path: "logging.level",
        kind: ValueKind::Text,
    },
    EnvMapping {
        var_name: "CONDUIT_LOG_FORMAT",
        field_path: "logging.format",
        kind: ValueKind::Text,
    },
    EnvMapping {
        var_name: "CONDUIT_UNIT_TIMEOUT_MS",
        field_path: "engine.unit_timeout_ms",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_PIN_STATUS_ON_ERROR",
        field_path: "engine.pin_status_on_error",
        kind: ValueKind::Bool,
    },
    EnvMapping {
        var_name: "CONDUIT_TASK_TIMEOUT_MS",
        field_path: "tasks.default_timeout_ms",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_BREAKER_FAILURE_THRESHOLD",
        field_path: "circuit_breaker.failure_threshold",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_BREAKER_FAILURE_RATE",
        field_path: "circuit_breaker.failure_rate_threshold",
        kind: ValueKind::Float,
    },
    EnvMapping {
        var_name: "CONDUIT_BREAKER_OPEN_TIMEOUT_MS",
        field_path: "circuit_breaker.open_timeout_ms",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_RATE_LIMIT_WINDOW_MS",
        field_path: "rate_limit.window_ms",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_RATE_LIMIT_MAX_REQUESTS",
        field_path: "rate_limit.max_requests",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_RETRY_MAX_ATTEMPTS",
        field_path: "retry.max_attempts",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "CONDUIT_EVENTS_CAPACITY",
        field_path: "events.channel_capacity",
        kind: ValueKind::Integer,
    },
];

/// Snapshot the process environment, keeping only `CONDUIT_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Apply environment fallbacks to fields not present in `file_set`.
///
/// Returns the names of the variables that were applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a variable cannot be converted to
/// the type of its field.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    file_set: &FileSetFields,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Vec<&'static str>> {
    let mut applied = Vec::new();

    for mapping in ENV_MAPPINGS {
        if file_set.contains(mapping.field_path) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        let value = coerce(mapping, raw)?;
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        set_field(merged, mapping.field_path, value);
        applied.push(mapping.var_name);
    }

    Ok(applied)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let raw = raw.trim();
    let invalid = |expected: &str| ConfigError::EnvError {
        var_name: mapping.var_name.to_owned(),
        message: format!("expected {expected}, got '{raw}'"),
    };

    match mapping.kind {
        ValueKind::Integer => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| invalid("an integer")),
        ValueKind::Float => raw
            .parse::<f64>()
            .map(toml::Value::Float)
            .map_err(|_| invalid("a number")),
        ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" => Ok(toml::Value::Boolean(false)),
            _ => Err(invalid("a boolean")),
        },
        ValueKind::Text => Ok(toml::Value::String(raw.to_owned())),
    }
}

fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}
