//! Error types for the Warden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller exceeded its limit or is blocked
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// Backend errors that escaped the coordinator (only during setup)
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Infrastructure failures reported by a rate limit backend.
///
/// These never reach callers of the coordinator; they drive failover.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The call did not finish within the configured bound
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No usable connection to the store
    #[error("connection failed: {0}")]
    Connection(String),

    /// The store rejected or failed the command
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store answered with something we cannot interpret
    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
