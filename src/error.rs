//! Error types for the Sentinel service.

use thiserror::Error;

/// Main error type for Sentinel operations.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors (unreachable service, undecodable record)
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for SentinelError {
    fn from(err: redis::RedisError) -> Self {
        SentinelError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        SentinelError::Backend(format!("record encoding: {}", err))
    }
}

/// Result type alias for Sentinel operations.
pub type Result<T> = std::result::Result<T, SentinelError>;
