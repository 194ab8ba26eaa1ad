//! Plugin error types.

/// Error returned by plugin lifecycle methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// Initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid arguments passed by the host
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A required resource was missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

/// Plugin result type
pub type PluginResult<T> = Result<T, PluginError>;
