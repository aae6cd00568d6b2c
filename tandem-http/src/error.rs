//! Error types for the HTTP remote

use tandem_core::{ReplicationError, TransportError};
use thiserror::Error;

/// Result type alias for HTTP remote operations
pub type Result<T> = std::result::Result<T, HttpError>;

/// HTTP remote error types
#[derive(Error, Debug)]
pub enum HttpError {
    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// URL parsed but cannot address a database
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Request failed or returned an error status
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<HttpError> for ReplicationError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Transport(e) => ReplicationError::Transport(e),
            other => ReplicationError::InvalidConfig(other.to_string()),
        }
    }
}

/// Map a reqwest failure onto the transport error taxonomy
pub(crate) fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_decode() {
        TransportError::InvalidResponse(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}
