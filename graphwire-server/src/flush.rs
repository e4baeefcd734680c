//! Flush coordination.
//!
//! Responses are buffered in the connection's [`ChunkWriter`] and only sent
//! when the connection goes quiet: no message is being executed and no
//! further message is partially received. Pipelined requests therefore
//! share flushes, while a client waiting on its last response always gets
//! it.

use crate::error::ServerError;
use crate::metrics::Metrics;
use graphwire_protocol::{Channel, ChunkWriter, TransferState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Send buffer shared by the input side and the execution worker.
pub type SharedWriter = Arc<Mutex<ChunkWriter<Arc<dyn Channel>>>>;

/// Sender half used to report connection-fatal faults to the supervisor.
pub type FaultSender = mpsc::UnboundedSender<ServerError>;

/// Receiver half polled by the connection supervisor.
pub type FaultReceiver = mpsc::UnboundedReceiver<ServerError>;

/// Lifetime totals of the start and completion hooks.
#[derive(Debug, Default)]
struct HookCounts {
    started: AtomicU64,
    completed: AtomicU64,
}

/// Tracks in-flight messages and flushes output at quiescence.
#[derive(Clone)]
pub struct FlushCoordinator {
    state: Arc<TransferState>,
    hooks: Arc<HookCounts>,
    output: SharedWriter,
    faults: FaultSender,
    metrics: Option<Arc<Metrics>>,
}

impl FlushCoordinator {
    pub fn new(state: Arc<TransferState>, output: SharedWriter, faults: FaultSender) -> Self {
        Self {
            state,
            hooks: Arc::new(HookCounts::default()),
            output,
            faults,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Records a message handed to the session layer.
    pub fn on_message_started(&self) -> u64 {
        self.hooks.started.fetch_add(1, Ordering::AcqRel);
        self.state.message_started()
    }

    /// Records the end of a message's processing and flushes the send
    /// buffer when nothing else is in flight or partially received.
    ///
    /// Returns whether a flush happened. A failed flush leaves the
    /// connection unusable and is returned as [`ServerError::Output`].
    pub fn on_message_completed(&self) -> Result<bool, ServerError> {
        self.hooks.completed.fetch_add(1, Ordering::AcqRel);
        let completion = self.state.message_completed()?;
        if !completion.should_flush() {
            return Ok(false);
        }

        let mut output = self.output.lock();
        if output.is_closed() {
            return Ok(false);
        }
        output.flush().map_err(ServerError::Output)?;
        drop(output);

        if let Some(ref metrics) = self.metrics {
            metrics.flushes_total.inc();
        }
        Ok(true)
    }

    /// Returns a guard that completes one started message when dropped.
    pub fn completion_guard(&self) -> CompletionGuard {
        CompletionGuard {
            coordinator: Some(self.clone()),
        }
    }

    /// Hands a connection-fatal fault to the supervisor.
    pub fn report_fault(&self, err: ServerError) {
        if self.faults.send(err).is_err() {
            tracing::debug!("Fault reported after the connection supervisor stopped");
        }
    }

    /// Returns how many times the start hook has run.
    pub fn messages_started(&self) -> u64 {
        self.hooks.started.load(Ordering::Acquire)
    }

    /// Returns how many times the completion hook has run.
    pub fn messages_completed(&self) -> u64 {
        self.hooks.completed.load(Ordering::Acquire)
    }

    pub fn transfer_state(&self) -> &Arc<TransferState> {
        &self.state
    }

    pub fn output(&self) -> &SharedWriter {
        &self.output
    }
}

/// Fires the completion hook for one started message exactly once.
///
/// The hook runs when the guard is dropped, so it also runs when decoding
/// fails, when execution is skipped and when execution panics.
#[must_use = "dropping the guard completes the message immediately"]
pub struct CompletionGuard {
    coordinator: Option<FlushCoordinator>,
}

impl CompletionGuard {
    /// Completes the message now and returns whether output was flushed.
    pub fn complete(mut self) -> Result<bool, ServerError> {
        match self.coordinator.take() {
            Some(coordinator) => coordinator.on_message_completed(),
            None => Ok(false),
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            if let Err(e) = coordinator.on_message_completed() {
                tracing::error!("Flush on message completion failed: {}", e);
                coordinator.report_fault(e);
            }
        }
    }
}
