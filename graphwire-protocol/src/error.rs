//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing, decoding or output.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("input is closed")]
    InputClosed,

    #[error("output is closed")]
    OutputClosed,

    #[error("invalid handshake preamble: {0:#010x}")]
    InvalidPreamble(u32),

    #[error("no supported protocol version in {0:?}")]
    UnsupportedVersion([u32; 4]),
}

impl ProtocolError {
    /// Returns the client-visible error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::Framing(_) | ProtocolError::MessageTooLarge { .. } => {
                ErrorCode::ProtocolViolation
            }
            ProtocolError::Decode(_) | ProtocolError::Json(_) => ErrorCode::InvalidMessage,
            ProtocolError::InvalidPreamble(_) | ProtocolError::UnsupportedVersion(_) => {
                ErrorCode::UnsupportedProtocol
            }
            ProtocolError::Io(_) | ProtocolError::InputClosed | ProtocolError::OutputClosed => {
                ErrorCode::InternalError
            }
        }
    }

    /// Returns whether this error leaves the output path unusable.
    pub fn is_output_fault(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::OutputClosed)
    }
}

/// Stable error codes sent to clients in `FAILURE` responses.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    ProtocolViolation,
    InvalidMessage,

    // Request errors
    InvalidRequest,
    StatementFailed,

    // Session errors
    SessionClosed,

    // System errors
    InternalError,
}

impl ErrorCode {
    /// Returns whether the client caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnsupportedProtocol
                | ErrorCode::ProtocolViolation
                | ErrorCode::InvalidMessage
                | ErrorCode::InvalidRequest
                | ErrorCode::StatementFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            ErrorCode::InvalidMessage => write!(f, "INVALID_MESSAGE"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::StatementFailed => write!(f, "STATEMENT_FAILED"),
            ErrorCode::SessionClosed => write!(f, "SESSION_CLOSED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
