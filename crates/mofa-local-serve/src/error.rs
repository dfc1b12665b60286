//! Error types for the local serving control plane

use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// Degradations (probe failures, unsupported devices, invalid generations) are
/// handled internally and never reach callers as errors. What does reach callers
/// is either a fatal load condition or a configuration problem.
#[derive(Debug, Clone, Error)]
pub enum ServeError {
    /// Model artifact does not exist on disk
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Model loading failed (after any fallback was exhausted)
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// No runtime is registered that can handle the requested format
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A single inference call failed
    #[error("Model inference failed: {0}")]
    InferenceFailed(String),

    /// Device error (GPU unavailable, driver failure, etc.)
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for control plane operations
pub type ServeResult<T> = Result<T, ServeError>;

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ServeError {
    fn from(err: serde_json::Error) -> Self {
        ServeError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for ServeError {
    fn from(err: config::ConfigError) -> Self {
        ServeError::ConfigError(err.to_string())
    }
}
