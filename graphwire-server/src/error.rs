//! Server error types.

use crate::session::SessionError;
use graphwire_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Writing or flushing the response stream failed. The connection cannot
    /// recover from this.
    #[error("output failed: {0}")]
    Output(#[source] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("execution worker stopped")]
    WorkerStopped,

    #[error("execution worker panicked")]
    WorkerPanicked,

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(e) | ServerError::Handshake(e) => e.error_code(),
            ServerError::Session(e) => e.code,
            ServerError::Io(_)
            | ServerError::Output(_)
            | ServerError::HandshakeTimeout
            | ServerError::WorkerStopped
            | ServerError::WorkerPanicked
            | ServerError::Metrics(_) => ErrorCode::InternalError,
            ServerError::ShuttingDown => ErrorCode::SessionClosed,
        }
    }

    /// Returns whether the connection must be torn down without waiting for
    /// in-flight work.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Protocol(e) => e.is_output_fault(),
            ServerError::Session(e) => e.fatal,
            _ => true,
        }
    }
}
