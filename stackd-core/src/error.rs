//! Error types for stackd.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stackd operations.
pub type Result<T> = std::result::Result<T, StackdError>;

/// Main error type for stackd.
#[derive(Error, Debug)]
pub enum StackdError {
    // Document errors (bad caller input)
    #[error("Invalid compose document: {reason}")]
    InvalidDocument { reason: String },

    #[error("Unsupported services.{service}.{field} declaration. Only a list of strings is supported.")]
    UnsupportedDeclaration { service: String, field: String },

    // Secret store errors
    #[error("Secret key must not be blank")]
    InvalidKey,

    // Process errors
    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailure { exit_code: i32, stderr: String },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StackdError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// True when the error was caused by the submitted request rather than
    /// the platform, i.e. it should surface as a 4xx at the HTTP boundary.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDocument { .. } | Self::UnsupportedDeclaration { .. } | Self::InvalidKey
        )
    }
}
