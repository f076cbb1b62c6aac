//! Engine error types.

/// Errors returned by the engine.
///
/// A failing unit is never an error here; it is recorded as a failed
/// result. These variants cover caller misuse and registration failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `target_kinds` was given but empty.
    #[error("target_kinds must not be empty")]
    InvalidTargetKinds,

    /// The engine has been shut down.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Registry operation failed.
    #[error(transparent)]
    Plugin(#[from] conduit_plugins::PluginError),

    /// Tool table or tracker operation failed.
    #[error(transparent)]
    Task(#[from] conduit_tasks::TaskError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
