//! Socket-backed output channel.

use bytes::Bytes;
use graphwire_protocol::Channel;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// [`Channel`] that hands flushed blocks to an async writer task owning the
/// socket's write half.
///
/// `write` never blocks, so it can be called from the worker thread while
/// the send buffer lock is held. Once a socket write fails the channel is
/// broken and every later `write` fails with `BrokenPipe`.
pub struct SocketChannel {
    blocks: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    broken: Arc<AtomicBool>,
}

impl SocketChannel {
    /// Spawns the writer task on the current runtime.
    ///
    /// The task ends after the channel is closed and every queued block was
    /// written, or after the first write error.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(write_loop(writer, rx, broken.clone()));

        let channel = Self {
            blocks: Mutex::new(Some(tx)),
            broken,
        };
        (channel, task)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

impl Channel for SocketChannel {
    fn write(&self, bytes: Bytes) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket write failed"));
        }
        match *self.blocks.lock() {
            Some(ref tx) => tx
                .send(bytes)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket writer stopped")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed")),
        }
    }

    fn close(&self) {
        self.blocks.lock().take();
    }
}

async fn write_loop<W>(mut writer: W, mut blocks: mpsc::UnboundedReceiver<Bytes>, broken: Arc<AtomicBool>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(block) = blocks.recv().await {
        tracing::trace!("Writing {} bytes", block.len());
        if let Err(e) = writer.write_all(&block).await {
            tracing::debug!("Socket write failed: {}", e);
            broken.store(true, Ordering::Release);
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Socket shutdown failed: {}", e);
    }
}
