//! Protocol versions and the connection handshake.
//!
//! Handshake layout (client to server, 20 bytes):
//!
//! ```text
//! +------------+-----------+-----------+-----------+-----------+
//! | preamble   | version 1 | version 2 | version 3 | version 4 |
//! | 4 bytes    | u32 BE    | u32 BE    | u32 BE    | u32 BE    |
//! +------------+-----------+-----------+-----------+-----------+
//! ```
//!
//! Versions are listed in order of client preference; `0` means no
//! proposal. The server answers with the chosen version as a u32 BE, or
//! `0` when none is supported, and then closes the connection.

use crate::error::ProtocolError;
use crate::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_OUTPUT_BUFFER_SIZE, MAX_CHUNK_SIZE};
use bytes::{Buf, BufMut, BytesMut};

/// Magic preamble opening every connection.
pub const MAGIC_PREAMBLE: u32 = 0x6060_B017;

/// Size of the client handshake in bytes.
pub const HANDSHAKE_SIZE: usize = 20;

/// Size of the server handshake response in bytes.
pub const HANDSHAKE_RESPONSE_SIZE: usize = 4;

/// Version answered when no proposal is supported.
pub const NO_VERSION: u32 = 0;

/// Framing parameters that belong to a protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingConfig {
    /// Capacity of the outbound send buffer.
    pub output_buffer_size: usize,
    /// Largest payload carried by a single chunk.
    pub max_chunk_size: usize,
    /// Largest inbound message a peer may send.
    pub max_message_size: usize,
}

/// Protocol versions this implementation speaks.
///
/// Selected once during the handshake and fixed for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
}

impl ProtocolVersion {
    /// All supported versions, most preferred first.
    pub const SUPPORTED: [ProtocolVersion; 1] = [ProtocolVersion::V1];

    /// Returns the version number sent on the wire.
    pub fn number(&self) -> u32 {
        match self {
            ProtocolVersion::V1 => 1,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(ProtocolVersion::V1),
            _ => None,
        }
    }

    /// Returns the framing configuration of this version.
    pub fn framing(&self) -> FramingConfig {
        match self {
            ProtocolVersion::V1 => FramingConfig {
                output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
                max_chunk_size: MAX_CHUNK_SIZE,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            },
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Client handshake: preamble plus four version proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub proposals: [u32; 4],
}

impl HandshakeRequest {
    pub fn new(proposals: [u32; 4]) -> Self {
        Self { proposals }
    }

    /// Proposes every supported version in preference order.
    pub fn supported() -> Self {
        let mut proposals = [NO_VERSION; 4];
        for (slot, version) in proposals.iter_mut().zip(ProtocolVersion::SUPPORTED) {
            *slot = version.number();
        }
        Self { proposals }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE);
        buf.put_u32(MAGIC_PREAMBLE);
        for proposal in self.proposals {
            buf.put_u32(proposal);
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HANDSHAKE_SIZE {
            return Err(ProtocolError::Framing(format!(
                "handshake needs {} bytes, got {}",
                HANDSHAKE_SIZE,
                bytes.len()
            )));
        }

        let preamble = bytes.get_u32();
        if preamble != MAGIC_PREAMBLE {
            return Err(ProtocolError::InvalidPreamble(preamble));
        }

        let mut proposals = [NO_VERSION; 4];
        for proposal in proposals.iter_mut() {
            *proposal = bytes.get_u32();
        }
        Ok(Self { proposals })
    }

    /// Picks the first proposal this implementation supports.
    pub fn negotiate(&self) -> Result<ProtocolVersion, ProtocolError> {
        self.proposals
            .iter()
            .find_map(|&number| ProtocolVersion::from_number(number))
            .ok_or(ProtocolError::UnsupportedVersion(self.proposals))
    }
}

/// Encodes the server's handshake answer.
pub fn encode_response(version: Option<ProtocolVersion>) -> [u8; HANDSHAKE_RESPONSE_SIZE] {
    version.map_or(NO_VERSION, |v| v.number()).to_be_bytes()
}

/// Decodes the server's handshake answer.
pub fn decode_response(
    bytes: [u8; HANDSHAKE_RESPONSE_SIZE],
) -> Result<ProtocolVersion, ProtocolError> {
    let number = u32::from_be_bytes(bytes);
    ProtocolVersion::from_number(number)
        .ok_or(ProtocolError::UnsupportedVersion([number, NO_VERSION, NO_VERSION, NO_VERSION]))
}
