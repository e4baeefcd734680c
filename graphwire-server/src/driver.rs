//! Per-connection protocol driver.
//!
//! The driver is the entry point for one connection's byte streams. Input is
//! fed through [`ProtocolDriver::handle`] by a single reader; output is
//! written by whichever thread executes requests. Lock order is always input
//! before output.

use crate::bridge::MessageBridge;
use crate::config::{ExecutionMode, TransportConfig};
use crate::error::ServerError;
use crate::flush::{FaultReceiver, FlushCoordinator, SharedWriter};
use crate::metrics::Metrics;
use crate::session::Session;
use graphwire_protocol::{
    Channel, ChunkWriter, Dechunker, FramingConfig, JsonFormat, MessageFormat, ProtocolError,
    ProtocolVersion, TransferState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Input {
    dechunker: Dechunker,
    bridge: MessageBridge,
    closed: bool,
}

impl Input {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.dechunker.close();
            self.bridge.shutdown();
        }
    }
}

/// Builds a [`ProtocolDriver`].
pub struct DriverBuilder {
    version: ProtocolVersion,
    channel: Arc<dyn Channel>,
    session: Box<dyn Session>,
    format: Arc<dyn MessageFormat>,
    framing: FramingConfig,
    execution: ExecutionMode,
    metrics: Option<Arc<Metrics>>,
}

impl DriverBuilder {
    /// Uses a message format other than JSON.
    pub fn with_format(mut self, format: Arc<dyn MessageFormat>) -> Self {
        self.format = format;
        self
    }

    /// Applies the execution mode and any size overrides from `transport`.
    ///
    /// Sizes left unset keep the negotiated version's framing.
    pub fn with_transport(mut self, transport: &TransportConfig) -> Self {
        self.framing = transport.framing_for(self.version.framing());
        self.execution = transport.execution;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Creates the driver and the receiver on which connection-fatal faults
    /// from the output path are reported.
    pub fn build(self) -> Result<(ProtocolDriver, FaultReceiver), ServerError> {
        let state = Arc::new(TransferState::new());
        let output: SharedWriter = Arc::new(Mutex::new(ChunkWriter::with_framing(
            self.channel,
            &self.framing,
        )));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let coordinator = FlushCoordinator::new(state.clone(), output.clone(), faults_tx)
            .with_metrics(self.metrics.clone());
        let bridge = MessageBridge::new(
            self.format,
            self.session,
            coordinator.clone(),
            self.execution,
            self.metrics.clone(),
        )?;
        let drained = bridge.drained();
        let dechunker = Dechunker::with_framing(state, &self.framing);

        let driver = ProtocolDriver {
            version: self.version,
            input: Mutex::new(Input {
                dechunker,
                bridge,
                closed: false,
            }),
            output,
            coordinator,
            drained,
            metrics: self.metrics,
        };
        Ok((driver, faults_rx))
    }
}

/// Drives one connection: reassembles input into messages, hands them to
/// the session and owns the close sequence of both directions.
pub struct ProtocolDriver {
    version: ProtocolVersion,
    input: Mutex<Input>,
    output: SharedWriter,
    coordinator: FlushCoordinator,
    drained: watch::Receiver<bool>,
    metrics: Option<Arc<Metrics>>,
}

impl ProtocolDriver {
    /// Starts building a driver for a negotiated protocol version.
    pub fn builder(
        version: ProtocolVersion,
        channel: Arc<dyn Channel>,
        session: Box<dyn Session>,
    ) -> DriverBuilder {
        DriverBuilder {
            version,
            channel,
            session,
            format: Arc::new(JsonFormat::new()),
            framing: version.framing(),
            execution: ExecutionMode::default(),
            metrics: None,
        }
    }

    /// Feeds one inbound fragment.
    ///
    /// Any fault while parsing or delivering is answered with a `FAILURE`
    /// response queued behind in-flight work, after which input is closed
    /// and the fault returned. Output stays open so those responses can
    /// still be sent.
    pub fn handle(&self, data: &[u8]) -> Result<(), ServerError> {
        let mut input = self.input.lock();
        if input.closed {
            return Err(ServerError::Protocol(ProtocolError::InputClosed));
        }
        if let Some(ref metrics) = self.metrics {
            metrics.bytes_received_total.inc_by(data.len() as f64);
        }

        let Input {
            dechunker, bridge, ..
        } = &mut *input;
        let metrics = self.metrics.as_deref();
        let result = dechunker.feed(data, |payload| {
            if let Some(metrics) = metrics {
                metrics.messages_received_total.inc();
            }
            bridge.deliver(payload)
        });

        let err = match result {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        let code = err.error_code();
        tracing::warn!("Closing input after {}: {}", code, err);
        if let Some(ref metrics) = self.metrics {
            metrics
                .errors_total
                .with_label_values(&[code.to_string().as_str()])
                .inc();
        }

        // Clears the mid-message flag so the failure response can flush.
        input.dechunker.close();
        if let Err(e) = input.bridge.handle_fatal_error(code, err.to_string()) {
            tracing::debug!("Could not queue failure response: {}", e);
        }
        input.close();
        Err(err)
    }

    /// Closes input: discards any partial message and stops accepting new
    /// ones. Accepted work still runs and its responses are still sent.
    pub fn close_input(&self) {
        self.input.lock().close();
    }

    /// Closes both directions.
    ///
    /// Queued work that has not started is skipped. Completed responses
    /// still in the send buffer are flushed before the channel closes; a
    /// partially written response is dropped.
    pub fn close(&self) {
        let mut input = self.input.lock();
        input.bridge.abort();
        input.close();

        let mut output = self.output.lock();
        if let Err(e) = output.close() {
            tracing::debug!("Error closing output: {}", e);
        }
    }

    /// Waits until the session has finished all accepted work and been
    /// closed. Returns `false` on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let mut drained = self.drained.clone();
        // A dropped sender means the worker is gone, which also counts.
        let wait = async move {
            let _ = drained.wait_for(|done| *done).await;
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Returns the negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_input_closed(&self) -> bool {
        self.input.lock().closed
    }

    /// Returns the number of messages handed to the session and not yet
    /// completed.
    pub fn in_flight(&self) -> u64 {
        self.coordinator.transfer_state().in_flight()
    }

    /// Returns how many messages, including queued failures, have been
    /// handed to the session layer.
    pub fn messages_started(&self) -> u64 {
        self.coordinator.messages_started()
    }

    /// Returns how many started messages have completed.
    pub fn messages_completed(&self) -> u64 {
        self.coordinator.messages_completed()
    }

    /// Returns whether a message is partially received.
    pub fn is_mid_message(&self) -> bool {
        self.coordinator.transfer_state().is_mid_message()
    }

    pub fn is_output_closed(&self) -> bool {
        self.output.lock().is_closed()
    }
}
