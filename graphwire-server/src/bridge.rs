//! Hand-off from reassembled messages to the session layer.
//!
//! Every delivered payload is counted as started, decoded, executed and
//! counted as completed. Execution runs either inline on the caller's
//! thread or on a dedicated worker thread that processes requests strictly
//! in arrival order.

use crate::config::ExecutionMode;
use crate::error::ServerError;
use crate::flush::{CompletionGuard, FlushCoordinator, SharedWriter};
use crate::metrics::Metrics;
use crate::session::Session;
use bytes::Bytes;
use graphwire_protocol::{ErrorCode, MessageFormat, ProtocolError, Request, Response};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

enum Job {
    Execute {
        request: Request,
        guard: CompletionGuard,
    },
    Fail {
        code: ErrorCode,
        message: String,
        guard: CompletionGuard,
    },
}

/// Runs requests against the session and writes their responses.
struct Executor {
    session: Box<dyn Session>,
    format: Arc<dyn MessageFormat>,
    output: SharedWriter,
    coordinator: FlushCoordinator,
    metrics: Option<Arc<Metrics>>,
}

impl Executor {
    fn run(&mut self, job: Job) {
        // The guard lives until the responses are written.
        match job {
            Job::Execute { request, guard } => {
                self.execute(request);
                drop(guard);
            }
            Job::Fail {
                code,
                message,
                guard,
            } => {
                if let Err(e) = self.write_response(&Response::failure(code, message)) {
                    self.coordinator.report_fault(e);
                }
                drop(guard);
            }
        }
    }

    fn execute(&mut self, request: Request) {
        let name = request.name();
        let start = Instant::now();
        let result = self.session.execute(request);

        if let Some(ref metrics) = self.metrics {
            metrics
                .execution_duration
                .with_label_values(&[name])
                .observe(start.elapsed().as_secs_f64());
        }

        let (responses, fatal) = match result {
            Ok(responses) => (responses, None),
            Err(err) => {
                tracing::debug!("{} failed: {}", name, err);
                if let Some(ref metrics) = self.metrics {
                    metrics
                        .errors_total
                        .with_label_values(&[err.code.to_string().as_str()])
                        .inc();
                }
                let response = Response::failure(err.code, err.message.clone());
                (vec![response], err.fatal.then_some(err))
            }
        };

        for response in &responses {
            if let Err(e) = self.write_response(response) {
                tracing::error!("Failed to write {} response: {}", name, e);
                self.coordinator.report_fault(e);
                return;
            }
        }

        // Reported after the failure response is buffered so teardown
        // still sends it.
        if let Some(err) = fatal {
            self.coordinator.report_fault(ServerError::Session(err));
        }
    }

    /// Encodes one response message into the send buffer.
    fn write_response(&self, response: &Response) -> Result<(), ServerError> {
        let mut output = self.output.lock();
        if output.is_closed() {
            // Connection already torn down.
            return Ok(());
        }
        let err = match self.format.encode_response(response, &mut *output) {
            Ok(()) => return output.message_succeeded().map_err(ServerError::Output),
            Err(e) if e.is_output_fault() => return Err(ServerError::Output(e)),
            Err(e) => e,
        };

        if !output.discard_message() {
            return Err(ServerError::Output(ProtocolError::Framing(format!(
                "response partially sent before encoding failed: {}",
                err
            ))));
        }
        tracing::warn!("Failed to encode response: {}", err);
        let failure = Response::failure(ErrorCode::InternalError, err.to_string());
        self.format
            .encode_response(&failure, &mut *output)
            .and_then(|()| output.message_succeeded())
            .map_err(ServerError::Output)
    }
}

struct Worker {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        mut executor: Executor,
        skip: Arc<AtomicBool>,
        done: watch::Sender<bool>,
    ) -> Result<Self, ServerError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let coordinator = executor.coordinator.clone();

        let thread = thread::Builder::new()
            .name("graphwire-worker".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if skip.load(Ordering::Acquire) {
                        // Dropping the job completes it without running it.
                        continue;
                    }
                    if panic::catch_unwind(AssertUnwindSafe(|| executor.run(job))).is_err() {
                        tracing::error!("Execution worker panicked");
                        coordinator.report_fault(ServerError::WorkerPanicked);
                        break;
                    }
                }
                // Completes anything still queued after a panic.
                drop(rx);
                executor.session.close();
                let _ = done.send(true);
            })?;

        Ok(Self {
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<(), ServerError> {
        match self.jobs {
            // A rejected job is dropped here, completing its guard.
            Some(ref jobs) => jobs.send(job).map_err(|_| ServerError::WorkerStopped),
            None => Err(ServerError::WorkerStopped),
        }
    }

    fn stop(&mut self) {
        self.jobs = None;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs = None;
        // Detach: the thread finishes the queue on its own.
        self.thread.take();
    }
}

enum Dispatch {
    Inline {
        executor: Executor,
        done: watch::Sender<bool>,
    },
    Worker(Worker),
}

/// Delivers decoded requests to the session and completion events to the
/// [`FlushCoordinator`].
pub struct MessageBridge {
    format: Arc<dyn MessageFormat>,
    coordinator: FlushCoordinator,
    dispatch: Dispatch,
    skip: Arc<AtomicBool>,
    drained: watch::Receiver<bool>,
    stopped: bool,
}

impl MessageBridge {
    pub fn new(
        format: Arc<dyn MessageFormat>,
        session: Box<dyn Session>,
        coordinator: FlushCoordinator,
        mode: ExecutionMode,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ServerError> {
        let executor = Executor {
            session,
            format: format.clone(),
            output: coordinator.output().clone(),
            coordinator: coordinator.clone(),
            metrics,
        };
        let skip = Arc::new(AtomicBool::new(false));
        let (done, drained) = watch::channel(false);

        let dispatch = match mode {
            ExecutionMode::Inline => Dispatch::Inline { executor, done },
            ExecutionMode::Worker => Dispatch::Worker(Worker::spawn(executor, skip.clone(), done)?),
        };

        Ok(Self {
            format,
            coordinator,
            dispatch,
            skip,
            drained,
            stopped: false,
        })
    }

    /// Executes one reassembled message.
    ///
    /// The message counts as in flight from here until its responses are
    /// written. A payload that fails to decode is completed immediately and
    /// its error returned.
    pub fn deliver(&mut self, payload: Bytes) -> Result<(), ServerError> {
        self.coordinator.on_message_started();
        let guard = self.coordinator.completion_guard();

        let request = self.format.decode_request(&payload)?;
        tracing::trace!("Delivering {} ({} bytes)", request.name(), payload.len());
        self.submit(Job::Execute { request, guard })
    }

    /// Queues a `FAILURE` response behind all accepted work.
    pub fn handle_fatal_error(
        &mut self,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<(), ServerError> {
        self.coordinator.on_message_started();
        let guard = self.coordinator.completion_guard();
        self.submit(Job::Fail {
            code,
            message: message.into(),
            guard,
        })
    }

    /// Stops accepting messages. Accepted work still runs, then the session
    /// is closed.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        match self.dispatch {
            Dispatch::Inline {
                ref mut executor,
                ref done,
            } => {
                executor.session.close();
                let _ = done.send(true);
            }
            Dispatch::Worker(ref mut worker) => worker.stop(),
        }
    }

    /// Stops accepting messages and skips accepted work that has not
    /// started yet.
    pub fn abort(&mut self) {
        self.skip.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Returns a receiver that turns `true` once the session is closed.
    pub fn drained(&self) -> watch::Receiver<bool> {
        self.drained.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn submit(&mut self, job: Job) -> Result<(), ServerError> {
        if self.stopped {
            return Err(ServerError::Protocol(ProtocolError::InputClosed));
        }
        match self.dispatch {
            Dispatch::Inline {
                ref mut executor, ..
            } => {
                executor.run(job);
                Ok(())
            }
            Dispatch::Worker(ref worker) => worker.submit(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::FaultReceiver;
    use crate::session::{LoopbackSession, SessionError};
    use graphwire_protocol::{
        Channel, ChunkWriter, Dechunker, JsonFormat, MemoryChannel, TransferState,
    };
    use parking_lot::Mutex;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Fixture {
        channel: Arc<MemoryChannel>,
        coordinator: FlushCoordinator,
        faults: FaultReceiver,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(MemoryChannel::new());
        let dyn_channel: Arc<dyn Channel> = channel.clone();
        let output = Arc::new(Mutex::new(ChunkWriter::new(dyn_channel)));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let coordinator = FlushCoordinator::new(Arc::new(TransferState::new()), output, tx);
        Fixture {
            channel,
            coordinator,
            faults: rx,
        }
    }

    fn bridge(f: &Fixture, session: Box<dyn Session>, mode: ExecutionMode) -> MessageBridge {
        MessageBridge::new(
            Arc::new(JsonFormat::new()),
            session,
            f.coordinator.clone(),
            mode,
            None,
        )
        .unwrap()
    }

    fn payload(request: &Request) -> Bytes {
        Bytes::from(serde_json::to_vec(request).unwrap())
    }

    fn responses(channel: &MemoryChannel) -> Vec<Response> {
        let mut out = Vec::new();
        Dechunker::new()
            .feed(&channel.contents(), |payload| {
                out.push(serde_json::from_slice(&payload).unwrap());
                Ok::<_, ProtocolError>(())
            })
            .unwrap();
        out
    }

    fn wait_drained(bridge: &MessageBridge) {
        let drained = bridge.drained();
        for _ in 0..500 {
            if *drained.borrow() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("bridge did not drain");
    }

    /// Session that blocks each request until the test releases it.
    struct GatedSession {
        gate: std_mpsc::Receiver<()>,
        closed: Arc<AtomicBool>,
    }

    impl Session for GatedSession {
        fn execute(&mut self, _request: Request) -> Result<Vec<Response>, SessionError> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            Ok(vec![Response::success()])
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    struct PanickingSession;

    impl Session for PanickingSession {
        fn execute(&mut self, _request: Request) -> Result<Vec<Response>, SessionError> {
            panic!("session bug");
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_inline_execution_flushes() {
        let f = fixture();
        let mut bridge = bridge(&f, Box::new(LoopbackSession::new()), ExecutionMode::Inline);

        bridge.deliver(payload(&Request::run("RETURN 1"))).unwrap();
        bridge.deliver(payload(&Request::PullAll)).unwrap();

        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
        let responses = responses(&f.channel);
        assert_eq!(responses.len(), 3);
        assert!(matches!(responses[1], Response::Record { .. }));
    }

    #[test]
    fn test_decode_failure_completes_message() {
        let f = fixture();
        let mut bridge = bridge(&f, Box::new(LoopbackSession::new()), ExecutionMode::Inline);

        let err = bridge.deliver(Bytes::from_static(b"not json")).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidMessage);
        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
    }

    #[test]
    fn test_session_failure_becomes_failure_response() {
        let f = fixture();
        let mut bridge = bridge(&f, Box::new(LoopbackSession::new()), ExecutionMode::Inline);

        bridge.deliver(payload(&Request::run(""))).unwrap();
        bridge.deliver(payload(&Request::PullAll)).unwrap();

        let responses = responses(&f.channel);
        assert!(matches!(
            responses[0],
            Response::Failure {
                code: ErrorCode::StatementFailed,
                ..
            }
        ));
        assert_eq!(responses[1], Response::Ignored);
    }

    #[test]
    fn test_worker_preserves_order_and_flushes_once() {
        let f = fixture();
        let (release, gate) = std_mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let session = GatedSession {
            gate,
            closed: closed.clone(),
        };
        let mut bridge = bridge(&f, Box::new(session), ExecutionMode::Worker);

        for _ in 0..3 {
            bridge.deliver(payload(&Request::DiscardAll)).unwrap();
        }
        bridge
            .handle_fatal_error(ErrorCode::ProtocolViolation, "bad chunk")
            .unwrap();
        assert_eq!(f.coordinator.transfer_state().in_flight(), 4);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        bridge.shutdown();
        wait_drained(&bridge);

        assert!(closed.load(Ordering::Acquire));
        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
        // Everything went out in a single flush, failure last.
        assert_eq!(f.channel.write_count(), 1);
        let responses = responses(&f.channel);
        assert_eq!(responses.len(), 4);
        assert!(matches!(
            responses[3],
            Response::Failure {
                code: ErrorCode::ProtocolViolation,
                ..
            }
        ));
    }

    #[test]
    fn test_abort_skips_queued_work() {
        let f = fixture();
        let (release, gate) = std_mpsc::channel();
        let session = GatedSession {
            gate,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let mut bridge = bridge(&f, Box::new(session), ExecutionMode::Worker);

        for _ in 0..5 {
            bridge.deliver(payload(&Request::DiscardAll)).unwrap();
        }
        bridge.abort();
        release.send(()).unwrap();
        wait_drained(&bridge);

        // Skipped messages were still completed.
        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
        assert!(responses(&f.channel).len() <= 1);
        assert!(bridge.deliver(payload(&Request::Reset)).is_err());
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let mut f = fixture();
        let mut bridge = bridge(&f, Box::new(PanickingSession), ExecutionMode::Worker);

        bridge.deliver(payload(&Request::Reset)).unwrap();
        wait_drained(&bridge);

        assert!(matches!(
            f.faults.try_recv(),
            Ok(ServerError::WorkerPanicked)
        ));
        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
        assert!(matches!(
            bridge.deliver(payload(&Request::Reset)),
            Err(ServerError::WorkerStopped)
        ));
        assert_eq!(f.coordinator.transfer_state().in_flight(), 0);
    }

    #[test]
    fn test_fatal_session_error_is_reported() {
        let mut f = fixture();
        let mut session = LoopbackSession::new();
        session.close();
        let mut bridge = bridge(&f, Box::new(session), ExecutionMode::Inline);

        bridge.deliver(payload(&Request::Reset)).unwrap();

        assert!(matches!(f.faults.try_recv(), Ok(ServerError::Session(_))));
        assert!(matches!(
            responses(&f.channel)[0],
            Response::Failure {
                code: ErrorCode::SessionClosed,
                ..
            }
        ));
    }
}
