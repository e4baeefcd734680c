//! # graphwire-protocol
//!
//! Wire protocol implementation for graphwire.
//!
//! This crate provides:
//! - Chunked message framing (outbound `ChunkWriter`, inbound `Dechunker`)
//! - Shared transfer state used to decide when to flush output
//! - Protocol versions and the connection handshake
//! - A pluggable message format with a JSON implementation
//! - Error codes and protocol constants

pub mod channel;
pub mod chunk;
pub mod codec;
pub mod dechunk;
pub mod error;
pub mod handshake;
pub mod message;
pub mod state;

pub use channel::{Channel, MemoryChannel};
pub use chunk::{encode_message, ChunkWriter};
pub use codec::{JsonFormat, MessageFormat};
pub use dechunk::{DechunkState, Dechunker};
pub use error::{ErrorCode, ProtocolError};
pub use handshake::{FramingConfig, HandshakeRequest, ProtocolVersion, MAGIC_PREAMBLE};
pub use message::{Request, Response};
pub use state::{Completion, TransferState};

/// Size of a chunk length header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Default capacity of the outbound send buffer.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 8192;

/// Default maximum size of a reassembled inbound message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default port for graphwire servers.
pub const DEFAULT_PORT: u16 = 7687;
