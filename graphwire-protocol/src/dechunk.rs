//! Inbound chunk reassembly.
//!
//! Network reads arrive in fragments whose boundaries are unrelated to chunk
//! boundaries. The dechunker keeps a partial header and the payload of the
//! message being assembled between calls:
//!
//! ```text
//! AwaitingHeader --(len > 0)--> AwaitingPayload --(payload done)--> AwaitingHeader
//! AwaitingHeader --(len = 0)--> deliver message, AwaitingHeader
//! any --close()--> Closed
//! ```

use crate::error::ProtocolError;
use crate::handshake::FramingConfig;
use crate::state::TransferState;
use crate::{CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Externally visible parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DechunkState {
    AwaitingHeader,
    AwaitingPayload,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    AwaitingPayload { remaining: usize },
    Closed,
}

/// Reassembles length-prefixed chunks into complete messages.
///
/// Only one thread may feed a dechunker. The mid-message flag is published
/// through the shared [`TransferState`] so other threads can read it.
pub struct Dechunker {
    state: State,
    header: [u8; CHUNK_HEADER_SIZE],
    header_len: usize,
    message: BytesMut,
    in_message: bool,
    max_message_size: usize,
    transfer: Arc<TransferState>,
}

impl Dechunker {
    pub fn new() -> Self {
        Self::with_state(Arc::new(TransferState::new()))
    }

    /// Creates a dechunker publishing its mid-message flag into `transfer`.
    pub fn with_state(transfer: Arc<TransferState>) -> Self {
        Self {
            state: State::AwaitingHeader,
            header: [0; CHUNK_HEADER_SIZE],
            header_len: 0,
            message: BytesMut::new(),
            in_message: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            transfer,
        }
    }

    /// Creates a dechunker bounded by a protocol version's framing parameters.
    pub fn with_framing(transfer: Arc<TransferState>, framing: &FramingConfig) -> Self {
        Self::with_state(transfer).with_max_message_size(framing.max_message_size)
    }

    /// Sets the largest message payload accepted before failing.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Consumes one inbound fragment, delivering every message it completes.
    ///
    /// Incomplete headers and payloads are kept for the next call. Returns
    /// the number of messages delivered. An error from `deliver` stops
    /// processing and is returned as is.
    pub fn feed<F, E>(&mut self, mut data: &[u8], mut deliver: F) -> Result<usize, E>
    where
        F: FnMut(Bytes) -> Result<(), E>,
        E: From<ProtocolError>,
    {
        if let State::Closed = self.state {
            return Err(ProtocolError::InputClosed.into());
        }

        let mut delivered = 0;
        while !data.is_empty() {
            match self.state {
                State::AwaitingHeader => {
                    self.set_in_message(true);

                    let n = (CHUNK_HEADER_SIZE - self.header_len).min(data.len());
                    self.header[self.header_len..self.header_len + n].copy_from_slice(&data[..n]);
                    self.header_len += n;
                    data = &data[n..];
                    if self.header_len < CHUNK_HEADER_SIZE {
                        break;
                    }

                    self.header_len = 0;
                    let len = u16::from_be_bytes(self.header) as usize;
                    if len == 0 {
                        let payload = self.message.split().freeze();
                        self.set_in_message(false);
                        deliver(payload)?;
                        delivered += 1;
                    } else {
                        let size = self.message.len() + len;
                        if size > self.max_message_size {
                            return Err(ProtocolError::MessageTooLarge {
                                size,
                                max: self.max_message_size,
                            }
                            .into());
                        }
                        self.message.reserve(len);
                        self.state = State::AwaitingPayload { remaining: len };
                    }
                }
                State::AwaitingPayload { remaining } => {
                    let n = remaining.min(data.len());
                    self.message.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    self.state = if n == remaining {
                        State::AwaitingHeader
                    } else {
                        State::AwaitingPayload {
                            remaining: remaining - n,
                        }
                    };
                }
                State::Closed => return Err(ProtocolError::InputClosed.into()),
            }
        }

        Ok(delivered)
    }

    /// Returns whether part of a message has been received but not its
    /// boundary marker.
    pub fn is_mid_message(&self) -> bool {
        self.in_message
    }

    /// Returns the shared transfer state.
    pub fn transfer_state(&self) -> &Arc<TransferState> {
        &self.transfer
    }

    pub fn state(&self) -> DechunkState {
        match self.state {
            State::AwaitingHeader => DechunkState::AwaitingHeader,
            State::AwaitingPayload { .. } => DechunkState::AwaitingPayload,
            State::Closed => DechunkState::Closed,
        }
    }

    /// Returns the number of bytes held for the message being assembled.
    pub fn buffered(&self) -> usize {
        self.message.len() + self.header_len
    }

    /// Discards any partial message. Later calls to `feed` fail.
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.header_len = 0;
        self.message = BytesMut::new();
        self.set_in_message(false);
    }

    fn set_in_message(&mut self, in_message: bool) {
        if self.in_message != in_message {
            self.in_message = in_message;
            self.transfer.set_mid_message(in_message);
        }
    }
}

impl Default for Dechunker {
    fn default() -> Self {
        Self::new()
    }
}
