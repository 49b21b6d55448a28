//! Error types for the Floodgate subsystem.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid rate limit policy
    #[error("Policy error: {0}")]
    Policy(String),

    /// Bucket or metrics storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by bucket and metrics storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store cannot be reached or failed mid-operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Another writer held the row while this transition tried to apply.
    #[error("concurrent update conflict on {0}")]
    Conflict(String),

    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<::config::ConfigError> for FloodgateError {
    fn from(err: ::config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for FloodgateError {
    fn from(err: serde_yaml::Error) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
