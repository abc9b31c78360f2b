//! Error types for pipelink.

use thiserror::Error;

/// Main error type for all pipelink operations.
#[derive(Debug, Error)]
pub enum PipelinkError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Endpoint string could not be parsed for the selected transport.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Protocol error (oversized frame, garbled framing).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using PipelinkError.
pub type Result<T> = std::result::Result<T, PipelinkError>;
