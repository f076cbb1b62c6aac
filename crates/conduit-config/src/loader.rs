//! Config file discovery and layered loading.
//!
//! 1. Parse embedded `defaults.toml`
//! 2. Merge the user file, then the workspace file
//! 3. Apply `CONDUIT_*` fallbacks to fields no file set
//! 4. Deserialize into [`Config`] and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{FileSetFields, collect_leaf_paths, deep_merge};
use crate::types::Config;
use crate::validate;

const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum accepted config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Directory name used under the home directory and the workspace root.
const CONDUIT_DIR: &str = ".conduit";

const CONFIG_FILE: &str = "config.toml";

/// A loaded configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The validated configuration.
    pub config: Config,
    /// Files that contributed, lowest precedence first.
    pub loaded_files: Vec<PathBuf>,
    /// Environment variables that filled unset fields.
    pub env_applied: Vec<String>,
}

/// Load configuration from the process environment and standard locations.
///
/// `conduit_home` overrides the user config directory; otherwise
/// `CONDUIT_HOME` or `~/.conduit` is used.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is malformed or too large, or the
/// merged configuration fails validation.
pub fn load(
    workspace_root: Option<&Path>,
    conduit_home: Option<&Path>,
) -> ConfigResult<ResolvedConfig> {
    let env_vars = collect_env_vars();
    let home = match conduit_home {
        Some(dir) => dir.to_path_buf(),
        None => default_conduit_home(&env_vars)?,
    };
    load_from(workspace_root, Some(&home), &env_vars)
}

/// Load configuration from explicit inputs.
///
/// # Errors
///
/// Same as [`load`].
pub fn load_from<S: ::std::hash::BuildHasher>(
    workspace_root: Option<&Path>,
    conduit_home: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged = embedded_defaults()?;
    let mut file_set = FileSetFields::new();
    let mut loaded_files = Vec::new();

    let candidates = [
        conduit_home.map(|home| home.join(CONFIG_FILE)),
        workspace_root.map(|root| root.join(CONDUIT_DIR).join(CONFIG_FILE)),
    ];

    for path in candidates.into_iter().flatten() {
        if let Some(layer) = try_load_file(&path)? {
            collect_leaf_paths(&layer, "", &mut file_set);
            deep_merge(&mut merged, &layer);
            debug!(path = %path.display(), "merged config layer");
            loaded_files.push(path);
        }
    }

    let env_applied = apply_env_fallbacks(&mut merged, &file_set, env_vars)?
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();

    let config: Config = merged.try_into().map_err(ConfigError::SchemaError)?;
    validate::validate(&config)?;

    info!(
        files = loaded_files.len(),
        env_vars = env_applied.len(),
        "configuration loaded"
    );

    Ok(ResolvedConfig {
        config,
        loaded_files,
        env_applied,
    })
}

/// Load one file over the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is missing, malformed or invalid.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let mut merged = embedded_defaults()?;
    let layer = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    deep_merge(&mut merged, &layer);

    let config: Config = merged.try_into().map_err(ConfigError::SchemaError)?;
    validate::validate(&config)?;
    Ok(config)
}

fn embedded_defaults() -> ConfigResult<toml::Value> {
    toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
        path: "<embedded defaults>".to_owned(),
        source: e,
    })
}

fn default_conduit_home<S: ::std::hash::BuildHasher>(
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<PathBuf> {
    if let Some(dir) = env_vars.get("CONDUIT_HOME").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(CONDUIT_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

/// Read and parse `path`, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}
