//! Outbound chunk framing.
//!
//! Chunk layout:
//!
//! ```text
//! +-----------+-------------------+
//! | length    | payload           |
//! | u16 BE    | length bytes      |
//! +-----------+-------------------+
//! ```
//!
//! A message is one or more non-empty chunks followed by a zero-length
//! chunk (`0x0000`) marking the message boundary.

use crate::channel::Channel;
use crate::error::ProtocolError;
use crate::handshake::FramingConfig;
use crate::{CHUNK_HEADER_SIZE, MAX_CHUNK_SIZE};
use bytes::{BufMut, BytesMut};
use std::io;

/// Smallest send buffer a writer will accept.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Encodes a complete message into `out` as chunks plus a boundary marker.
pub fn encode_message(payload: &[u8], out: &mut BytesMut) {
    let chunks = payload.len().div_ceil(MAX_CHUNK_SIZE);
    out.reserve(payload.len() + (chunks + 1) * CHUNK_HEADER_SIZE);
    for chunk in payload.chunks(MAX_CHUNK_SIZE) {
        out.put_u16(chunk.len() as u16);
        out.put_slice(chunk);
    }
    out.put_u16(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Failed(io::ErrorKind),
    Closed,
}

/// Splits outgoing messages into chunks and buffers them for the channel.
///
/// The send buffer has a fixed capacity. Small writes are coalesced into a
/// single open chunk whose header is filled in when the chunk closes; a
/// write too large for the free space is emitted as chunks of known length
/// streamed through the buffer. When the buffer fills up, its contents are
/// flushed to the channel to make room.
///
/// Once a channel write fails, every later write or flush fails too.
pub struct ChunkWriter<C: Channel> {
    channel: C,
    buffer: BytesMut,
    capacity: usize,
    max_chunk_size: usize,
    /// Offset of the reserved header of the open chunk.
    open_chunk: Option<usize>,
    /// Buffer length at the end of the last completed message.
    boundary: usize,
    in_message: bool,
    /// Part of the in-progress message has already reached the channel.
    message_flushed: bool,
    state: WriterState,
}

impl<C: Channel> ChunkWriter<C> {
    /// Creates a writer with the default 8 KiB send buffer.
    pub fn new(channel: C) -> Self {
        Self::with_capacity(channel, crate::DEFAULT_OUTPUT_BUFFER_SIZE)
    }

    /// Creates a writer with the given send buffer capacity.
    pub fn with_capacity(channel: C, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUFFER_SIZE);
        Self {
            channel,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            max_chunk_size: MAX_CHUNK_SIZE,
            open_chunk: None,
            boundary: 0,
            in_message: false,
            message_flushed: false,
            state: WriterState::Open,
        }
    }

    /// Creates a writer sized by a protocol version's framing parameters.
    pub fn with_framing(channel: C, framing: &FramingConfig) -> Self {
        Self::with_capacity(channel, framing.output_buffer_size)
            .with_max_chunk_size(framing.max_chunk_size)
    }

    /// Caps the payload of every emitted chunk, within `1..=MAX_CHUNK_SIZE`.
    pub fn with_max_chunk_size(mut self, max: usize) -> Self {
        self.max_chunk_size = max.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Returns the largest payload a single chunk may carry.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Appends bytes to the payload of the current message.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        self.in_message = true;

        while !data.is_empty() {
            let Some(offset) = self.open_chunk else {
                if data.len() + CHUNK_HEADER_SIZE <= self.available() {
                    self.begin_chunk();
                } else if data.len() + CHUNK_HEADER_SIZE <= self.capacity {
                    self.flush_buffer()?;
                    self.begin_chunk();
                } else {
                    let len = data.len().min(self.max_chunk_size);
                    self.write_known_chunk(&data[..len])?;
                    data = &data[len..];
                }
                continue;
            };

            let chunk_len = self.buffer.len() - offset - CHUNK_HEADER_SIZE;
            let n = data
                .len()
                .min(self.available())
                .min(self.max_chunk_size - chunk_len);
            self.buffer.put_slice(&data[..n]);
            data = &data[n..];

            if !data.is_empty() {
                self.close_chunk();
            }
        }

        Ok(())
    }

    /// Terminates the current message with a boundary marker.
    pub fn message_succeeded(&mut self) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        self.close_chunk();
        if self.available() < CHUNK_HEADER_SIZE {
            self.flush_buffer()?;
        }
        self.buffer.put_u16(0);
        self.boundary = self.buffer.len();
        self.in_message = false;
        self.message_flushed = false;
        Ok(())
    }

    /// Drops the in-progress message if none of it has been flushed yet.
    ///
    /// Returns `false` when part of the message already reached the channel
    /// and the stream can no longer be repaired.
    pub fn discard_message(&mut self) -> bool {
        if !self.in_message {
            return true;
        }
        if self.message_flushed {
            return false;
        }
        self.abandon_message();
        true
    }

    /// Sends everything buffered to the channel.
    ///
    /// A no-op on an empty buffer.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        self.close_chunk();
        self.flush_buffer()
    }

    /// Abandons any in-progress message, flushes completed messages and
    /// closes the channel.
    pub fn close(&mut self) -> Result<(), ProtocolError> {
        let result = match self.state {
            WriterState::Closed => return Ok(()),
            WriterState::Failed(_) => Ok(()),
            WriterState::Open => {
                self.abandon_message();
                self.flush_buffer()
            }
        };
        self.state = WriterState::Closed;
        self.buffer = BytesMut::new();
        self.channel.close();
        result
    }

    /// Returns whether a message is being written.
    pub fn is_in_message(&self) -> bool {
        self.in_message
    }

    /// Returns the number of bytes waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the send buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn available(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Failed(kind) => Err(ProtocolError::Io(io::Error::new(
                kind,
                "output channel previously failed",
            ))),
            WriterState::Closed => Err(ProtocolError::OutputClosed),
        }
    }

    fn begin_chunk(&mut self) {
        self.open_chunk = Some(self.buffer.len());
        self.buffer.put_u16(0);
    }

    fn close_chunk(&mut self) {
        let Some(offset) = self.open_chunk.take() else {
            return;
        };
        let len = self.buffer.len() - offset - CHUNK_HEADER_SIZE;
        if len == 0 {
            // An empty chunk would read as a boundary marker.
            self.buffer.truncate(offset);
        } else {
            self.buffer[offset..offset + CHUNK_HEADER_SIZE]
                .copy_from_slice(&(len as u16).to_be_bytes());
        }
    }

    /// Writes a chunk whose length is known up front, flushing as needed.
    fn write_known_chunk(&mut self, mut payload: &[u8]) -> Result<(), ProtocolError> {
        if self.available() < CHUNK_HEADER_SIZE {
            self.flush_buffer()?;
        }
        self.buffer.put_u16(payload.len() as u16);

        while !payload.is_empty() {
            if self.available() == 0 {
                self.flush_buffer()?;
            }
            let n = payload.len().min(self.available());
            self.buffer.put_slice(&payload[..n]);
            payload = &payload[n..];
        }
        Ok(())
    }

    fn abandon_message(&mut self) {
        if self.in_message {
            self.buffer.truncate(self.boundary);
            self.open_chunk = None;
            self.in_message = false;
            self.message_flushed = false;
        }
    }

    fn flush_buffer(&mut self) -> Result<(), ProtocolError> {
        debug_assert!(self.open_chunk.is_none());
        if self.buffer.is_empty() {
            return Ok(());
        }

        let block = self.buffer.split().freeze();
        self.buffer.reserve(self.capacity);
        self.boundary = 0;
        if self.in_message {
            self.message_flushed = true;
        }

        match self.channel.write(block) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = WriterState::Failed(e.kind());
                Err(ProtocolError::Io(e))
            }
        }
    }
}

impl<C: Channel> io::Write for ChunkWriter<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChunkWriter::write(self, buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ChunkWriter::flush(self).map_err(into_io_error)
    }
}

fn into_io_error(err: ProtocolError) -> io::Error {
    match err {
        ProtocolError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use std::io::Write as _;
    use std::sync::Arc;

    /// Splits a byte stream into chunk lengths (0 = boundary).
    fn chunk_lengths(mut bytes: &[u8]) -> Vec<usize> {
        let mut lengths = Vec::new();
        while bytes.len() >= CHUNK_HEADER_SIZE {
            let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            lengths.push(len);
            bytes = &bytes[CHUNK_HEADER_SIZE + len..];
        }
        assert!(bytes.is_empty(), "trailing bytes in stream");
        lengths
    }

    fn writer(capacity: usize) -> (Arc<MemoryChannel>, ChunkWriter<Arc<MemoryChannel>>) {
        let channel = Arc::new(MemoryChannel::new());
        let writer = ChunkWriter::with_capacity(channel.clone(), capacity);
        (channel, writer)
    }

    #[test]
    fn test_small_message_layout() {
        let (channel, mut writer) = writer(8192);
        writer.write(b"hello").unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(
            &channel.contents()[..],
            &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x00, 0x00]
        );
    }

    #[test]
    fn test_small_writes_are_coalesced() {
        let (channel, mut writer) = writer(8192);
        writer.write(b"ab").unwrap();
        writer.write(b"cd").unwrap();
        writer.write(b"ef").unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(chunk_lengths(&channel.contents()), vec![6, 0]);
    }

    #[test]
    fn test_empty_message_is_boundary_only() {
        let (channel, mut writer) = writer(8192);
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();
        assert_eq!(&channel.contents()[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_max_chunk_payload_is_one_chunk() {
        let (channel, mut writer) = writer(8192);
        writer.write(&vec![7u8; MAX_CHUNK_SIZE]).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(chunk_lengths(&channel.contents()), vec![MAX_CHUNK_SIZE, 0]);
    }

    #[test]
    fn test_payload_over_max_chunk_splits() {
        let (channel, mut writer) = writer(8192);
        writer.write(&vec![7u8; MAX_CHUNK_SIZE + 1]).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(
            chunk_lengths(&channel.contents()),
            vec![MAX_CHUNK_SIZE, 1, 0]
        );
    }

    #[test]
    fn test_coalesced_chunk_never_exceeds_max() {
        let (channel, mut writer) = writer(256 * 1024);
        for _ in 0..70 {
            writer.write(&[1u8; 1000]).unwrap();
        }
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        let lengths = chunk_lengths(&channel.contents());
        assert!(lengths.iter().all(|&len| len <= MAX_CHUNK_SIZE));
        assert_eq!(lengths.iter().sum::<usize>(), 70_000);
        assert_eq!(lengths.last(), Some(&0));
    }

    #[test]
    fn test_version_framing_sets_chunk_bound() {
        let framing = crate::ProtocolVersion::V1.framing();
        let channel = Arc::new(MemoryChannel::new());
        let mut writer = ChunkWriter::with_framing(channel.clone(), &framing);
        assert_eq!(writer.capacity(), framing.output_buffer_size);
        assert_eq!(writer.max_chunk_size(), framing.max_chunk_size);

        writer.write(&vec![1u8; framing.max_chunk_size]).unwrap();
        writer.message_succeeded().unwrap();
        writer.write(&vec![2u8; framing.max_chunk_size + 1]).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(
            chunk_lengths(&channel.contents()),
            vec![MAX_CHUNK_SIZE, 0, MAX_CHUNK_SIZE, 1, 0]
        );
    }

    #[test]
    fn test_smaller_chunk_bound_splits_writes() {
        let framing = FramingConfig {
            output_buffer_size: 64,
            max_chunk_size: 10,
            max_message_size: 1024,
        };
        let channel = Arc::new(MemoryChannel::new());
        let mut writer = ChunkWriter::with_framing(channel.clone(), &framing);

        // Coalesced small writes and a write larger than the buffer both
        // respect the bound.
        writer.write(b"abcdef").unwrap();
        writer.write(b"ghijkl").unwrap();
        writer.write(&[9u8; 100]).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        let lengths = chunk_lengths(&channel.contents());
        assert!(lengths.iter().all(|&len| len <= 10));
        assert_eq!(lengths.iter().sum::<usize>(), 112);
        assert_eq!(lengths.last(), Some(&0));
        assert_eq!(lengths.iter().filter(|&&len| len == 0).count(), 1);
    }

    #[test]
    fn test_chunk_bound_is_clamped() {
        let (_, zero) = writer(64);
        assert_eq!(zero.with_max_chunk_size(0).max_chunk_size(), 1);
        let (_, huge) = writer(64);
        assert_eq!(
            huge.with_max_chunk_size(usize::MAX).max_chunk_size(),
            MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn test_flush_on_empty_buffer_is_noop() {
        let (channel, mut writer) = writer(8192);
        writer.flush().unwrap();
        writer.flush().unwrap();
        assert_eq!(channel.write_count(), 0);
    }

    #[test]
    fn test_buffer_overflow_flushes_partially() {
        let (channel, mut writer) = writer(64);
        for _ in 0..10 {
            writer.write(&[9u8; 20]).unwrap();
            writer.message_succeeded().unwrap();
        }
        // Buffer overflowed at least once before the explicit flush.
        assert!(channel.write_count() > 0);
        assert!(writer.buffered() <= writer.capacity());

        writer.flush().unwrap();
        let lengths = chunk_lengths(&channel.contents());
        assert_eq!(lengths, [20usize, 0].repeat(10));
        assert!(channel.writes().iter().all(|block| block.len() <= 64));
    }

    #[test]
    fn test_failure_is_sticky() {
        let (channel, mut writer) = writer(8192);
        writer.write(b"data").unwrap();
        writer.message_succeeded().unwrap();

        channel.fail_writes();
        assert!(matches!(writer.flush(), Err(ProtocolError::Io(_))));

        // Later operations keep failing even on an empty buffer.
        assert!(matches!(writer.flush(), Err(ProtocolError::Io(_))));
        assert!(matches!(writer.write(b"x"), Err(ProtocolError::Io(_))));
    }

    #[test]
    fn test_close_abandons_partial_message() {
        let (channel, mut writer) = writer(8192);
        writer.write(b"complete").unwrap();
        writer.message_succeeded().unwrap();
        writer.write(b"partial").unwrap();

        writer.close().unwrap();

        assert_eq!(chunk_lengths(&channel.contents()), vec![8, 0]);
        assert!(channel.is_closed());
        assert!(matches!(writer.write(b"x"), Err(ProtocolError::OutputClosed)));
        // Closing twice is harmless.
        writer.close().unwrap();
    }

    #[test]
    fn test_discard_message() {
        let (channel, mut writer) = writer(8192);
        writer.write(b"keep").unwrap();
        writer.message_succeeded().unwrap();
        writer.write(b"drop").unwrap();

        assert!(writer.discard_message());
        assert!(!writer.is_in_message());
        writer.flush().unwrap();
        assert_eq!(chunk_lengths(&channel.contents()), vec![4, 0]);
    }

    #[test]
    fn test_discard_after_partial_flush_fails() {
        let (_channel, mut writer) = writer(32);
        writer.write(&[1u8; 100]).unwrap();
        assert!(!writer.discard_message());
    }

    #[test]
    fn test_io_write_streams_into_chunks() {
        let (channel, mut writer) = writer(8192);
        write!(writer, "{}-{}", "abc", 42).unwrap();
        writer.message_succeeded().unwrap();
        ChunkWriter::flush(&mut writer).unwrap();

        let contents = channel.contents();
        assert_eq!(chunk_lengths(&contents), vec![6, 0]);
        assert_eq!(&contents[2..8], b"abc-42");
    }

    #[test]
    fn test_encode_message_matches_writer() {
        let payload = vec![3u8; 150_000];
        let mut encoded = BytesMut::new();
        encode_message(&payload, &mut encoded);

        let (channel, mut writer) = writer(8192);
        writer.write(&payload).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        assert_eq!(&encoded[..], &channel.contents()[..]);
        assert_eq!(
            chunk_lengths(&encoded),
            vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 150_000 - 2 * MAX_CHUNK_SIZE, 0]
        );
    }

    #[test]
    fn test_minimum_capacity() {
        let (channel, mut writer) = writer(1);
        assert_eq!(writer.capacity(), MIN_BUFFER_SIZE);
        writer.write(b"0123456789abcdefghij").unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();
        assert_eq!(chunk_lengths(&channel.contents()), vec![20, 0]);
    }
}
