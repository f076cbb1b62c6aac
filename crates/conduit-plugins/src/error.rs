//! Plugin error types.

use crate::unit::UnitId;

/// Error raised by a unit's own hooks.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The unit could not initialize.
    #[error("initialization failed: {0}")]
    Init(String),

    /// The unit ran and failed.
    #[error("{0}")]
    Execution(String),

    /// The input payload is not what the unit expects.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Starting, stopping or probing the unit's service failed.
    #[error("service error: {0}")]
    Service(String),

    /// The unit rejected new settings.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl UnitError {
    /// Shorthand for [`UnitError::Execution`].
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// Result type for unit hooks.
pub type UnitResult<T> = Result<T, UnitError>;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The unit id is malformed.
    #[error("invalid unit id: {0}")]
    InvalidId(String),

    /// The descriptor is inconsistent.
    #[error("invalid descriptor for {unit_id}: {message}")]
    InvalidDescriptor {
        /// Unit whose descriptor was rejected.
        unit_id: UnitId,
        /// What is wrong with it.
        message: String,
    },

    /// Another lifecycle operation on this id has not finished.
    #[error("unit {0} is still loading or unloading")]
    InProgress(UnitId),

    /// No unit with this id is registered.
    #[error("unit not found: {0}")]
    NotFound(UnitId),

    /// A unit hook failed.
    #[error("unit {unit_id} failed: {source}")]
    Unit {
        /// Unit whose hook failed.
        unit_id: UnitId,
        /// The hook's error.
        #[source]
        source: UnitError,
    },
}

/// Result type for registry operations.
pub type PluginResult<T> = Result<T, PluginError>;
