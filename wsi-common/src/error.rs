//! Common error types for WSI services

use thiserror::Error;

/// Common result type for WSI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across WSI services
#[derive(Error, Debug)]
pub enum Error {
    /// Document store operation error
    #[error("Store error: {0}")]
    Store(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error (wraps serde_json::Error)
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller is not authorized for a mutating operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
