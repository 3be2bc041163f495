//! Error types for proxy operations

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or serving DNS queries
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-format or base64 decoding failure
    #[error("decode error: {0}")]
    Decode(String),

    /// Network or TLS failure while talking to an upstream
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream produced no response before the deadline
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// The upstream response has an unexpected status, content type, or shape
    #[error("invalid upstream response: {0}")]
    Validation(String),

    /// Queries the proxy does not handle (multi-question, unknown request shape)
    #[error("unsupported query: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
