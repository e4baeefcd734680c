//! Outbound byte channel abstraction.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ordered, reliable sink for outbound bytes.
///
/// Implementations may buffer or write asynchronously. A write error means
/// the channel is broken and must be treated as fatal by the caller.
pub trait Channel: Send + Sync {
    /// Writes one flushed block of bytes.
    fn write(&self, bytes: Bytes) -> io::Result<()>;

    /// Closes the channel. Writes after close fail.
    fn close(&self);
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn write(&self, bytes: Bytes) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// In-memory channel that records every write.
///
/// Each recorded block corresponds to one flush of the writer feeding it.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    writes: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `BrokenPipe`.
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::Release);
    }

    /// Returns the recorded writes.
    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    /// Returns the number of recorded writes.
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Returns all recorded bytes concatenated.
    pub fn contents(&self) -> BytesMut {
        let writes = self.writes.lock();
        let mut out = BytesMut::with_capacity(writes.iter().map(Bytes::len).sum());
        for block in writes.iter() {
            out.extend_from_slice(block);
        }
        out
    }

    /// Removes and returns all recorded bytes.
    pub fn take(&self) -> BytesMut {
        let contents = self.contents();
        self.writes.lock().clear();
        contents
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for MemoryChannel {
    fn write(&self, bytes: Bytes) -> io::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel failed"));
        }
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        self.writes.lock().push(bytes);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
