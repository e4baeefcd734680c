//! Client error types.

use graphwire_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] graphwire_protocol::ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[source] graphwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {code} - {message}")]
    ServerError { code: ErrorCode, message: String },

    /// The server skipped the request because an earlier one failed and
    /// the failure was not acknowledged yet.
    #[error("request ignored after an unacknowledged failure")]
    Ignored,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::ServerError { code, .. } => *code == ErrorCode::InternalError,
            _ => false,
        }
    }
}
