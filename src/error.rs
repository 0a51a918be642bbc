//! Error types for the Tracery event-learning pipeline
//!
//! This module provides structured error definitions using thiserror, with
//! anyhow reserved for the binary boundary.

use thiserror::Error;

/// Main error type for Tracery operations
#[derive(Error, Debug)]
pub enum TraceryError {
    /// Malformed caller input (4xx-equivalent, never retried automatically)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backing store unreachable (surfaced as service-unavailable, retryable)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// A module with the same name is already registered
    #[error("Duplicate module: {0}")]
    DuplicateModule(String),

    /// A module produced a result that violates the output contract
    #[error("Invalid module result: {0}")]
    InvalidResult(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error (completion provider)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Tracery operations
pub type Result<T> = std::result::Result<T, TraceryError>;

impl From<anyhow::Error> for TraceryError {
    fn from(err: anyhow::Error) -> Self {
        TraceryError::Other(err.to_string())
    }
}

impl From<libsql::Error> for TraceryError {
    fn from(err: libsql::Error) -> Self {
        TraceryError::Database(err.to_string())
    }
}
