//! Rendezvous error types

use thiserror::Error;

/// Rendezvous service and client error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed registration or signal request (rejected at the boundary, never retried)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),
}

impl Error {
    /// Whether the error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}

/// Result type for rendezvous operations
pub type Result<T> = std::result::Result<T, Error>;
