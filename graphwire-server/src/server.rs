//! TCP server implementation.

use crate::config::{Config, ExecutionMode, TransportConfig};
use crate::driver::ProtocolDriver;
use crate::error::ServerError;
use crate::flush::FaultReceiver;
use crate::metrics::Metrics;
use crate::session::{ConnectionInfo, SessionFactory};
use crate::socket::SocketChannel;
use graphwire_protocol::handshake::{encode_response, HANDSHAKE_SIZE};
use graphwire_protocol::{
    HandshakeRequest, JsonFormat, MessageFormat, ProtocolVersion, DEFAULT_PORT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Time allowed for the client handshake.
    pub handshake_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Framing and execution settings applied to every connection.
    pub transport: TransportConfig,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_connections", &self.max_connections)
            .field("transport", &self.transport)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 1000,
            transport: TransportConfig::default(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from loaded settings.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            handshake_timeout: config.network.handshake_timeout(),
            max_connections: config.network.max_connections,
            transport: config.transport.clone(),
            metrics: None,
        }
    }

    /// Sets the transport settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs.
struct ConnectionContext {
    config: ServerConfig,
    sessions: Arc<dyn SessionFactory>,
    format: Arc<dyn MessageFormat>,
}

/// How the read loop of a connection ended.
enum Exit {
    /// Client closed its side; finish accepted work first.
    Eof,
    /// Input was rejected; the failure response is queued behind accepted
    /// work.
    InputFault(ServerError),
    /// Output or session is unusable; tear down now.
    Fatal(ServerError),
    Idle,
    Shutdown,
}

/// TCP server for graphwire.
pub struct Server {
    config: ServerConfig,
    sessions: Arc<dyn SessionFactory>,
    format: Arc<dyn MessageFormat>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server opening sessions through `sessions`.
    pub fn new(config: ServerConfig, sessions: impl SessionFactory + 'static) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sessions: Arc::new(sessions),
            format: Arc::new(JsonFormat::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Uses a message format other than JSON.
    pub fn with_format(mut self, format: Arc<dyn MessageFormat>) -> Self {
        self.format = format;
        self
    }

    /// Binds to the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({:?} execution)",
            listener.local_addr()?,
            self.config.transport.execution
        );

        let context = Arc::new(ConnectionContext {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            format: self.format.clone(),
        });
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr, &context),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr, context: &Arc<ConnectionContext>) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let context = context.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, addr, &context, shutdown).await {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = context.config.metrics {
                metrics.connections_active.dec();
            }
            tracing::debug!("Client disconnected: {}", addr);
        });
    }

    /// Handles a single connection from handshake to teardown.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        context: &ConnectionContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let config = &context.config;
        stream.set_nodelay(true)?;

        let version = tokio::time::timeout(config.handshake_timeout, accept_handshake(&mut stream))
            .await
            .map_err(|_| ServerError::HandshakeTimeout)??;

        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            remote_addr: addr,
            version,
        };
        tracing::debug!("[{}] Client connected as {} ({})", addr, info.id, version);

        let (mut reader, writer) = stream.into_split();
        let (channel, writer_task) = SocketChannel::spawn(writer);
        let session = context.sessions.open(&info);
        let (driver, mut faults) = ProtocolDriver::builder(version, Arc::new(channel), session)
            .with_format(context.format.clone())
            .with_transport(&config.transport)
            .with_metrics(config.metrics.clone())
            .build()?;

        let mut buf = vec![0u8; config.transport.read_buffer_size];
        let exit = loop {
            tokio::select! {
                Some(fault) = faults.recv() => break Exit::Fatal(fault),

                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break Exit::Eof,
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            let execution = config.transport.execution;
                            if let Err(e) = feed(&driver, &buf[..n], execution) {
                                break if e.is_fatal() { Exit::Fatal(e) } else { Exit::InputFault(e) };
                            }
                        }
                        Err(e) => break Exit::Fatal(ServerError::Io(e)),
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => break Exit::Idle,

                _ = shutdown.recv() => break Exit::Shutdown,
            }
        };

        let result = match exit {
            Exit::Eof => {
                tracing::debug!("[{}] Connection closed by client", addr);
                driver.close_input();
                Self::drain(&driver, &mut faults, config.transport.drain_timeout(), addr).await
            }
            Exit::InputFault(e) => {
                tracing::debug!("[{}] Input closed: {}", addr, e);
                Self::drain(&driver, &mut faults, config.transport.drain_timeout(), addr)
                    .await
                    .and(Err(e))
            }
            Exit::Fatal(e) => {
                tracing::error!("[{}] Connection failed: {}", addr, e);
                Err(e)
            }
            Exit::Idle => {
                tracing::debug!("[{}] Idle timeout", addr);
                Ok(())
            }
            Exit::Shutdown => {
                tracing::debug!("[{}] Shutdown signal received", addr);
                Err(ServerError::ShuttingDown)
            }
        };

        driver.close();
        // Let the writer send what close() flushed.
        if tokio::time::timeout(config.transport.drain_timeout(), writer_task)
            .await
            .is_err()
        {
            tracing::debug!("[{}] Socket writer did not finish in time", addr);
        }
        result
    }

    /// Waits for accepted work to finish after input closed, unless the
    /// output path fails first.
    async fn drain(
        driver: &ProtocolDriver,
        faults: &mut FaultReceiver,
        timeout: Duration,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        tokio::select! {
            drained = driver.wait_drained(timeout) => {
                if !drained {
                    tracing::warn!(
                        "[{}] {} message(s) still in flight after {:?}, closing",
                        addr,
                        driver.in_flight(),
                        timeout
                    );
                }
                Ok(())
            }
            Some(fault) = faults.recv() => {
                tracing::error!("[{}] Connection failed while draining: {}", addr, fault);
                Err(fault)
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Feeds one read into the driver.
///
/// Inline execution runs the session on the calling task. On a
/// multi-threaded runtime the worker thread is handed over to the blocking
/// section so other connections keep making progress.
fn feed(driver: &ProtocolDriver, data: &[u8], execution: ExecutionMode) -> Result<(), ServerError> {
    let multi_thread = tokio::runtime::Handle::try_current()
        .map(|handle| handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
        .unwrap_or(false);
    if execution == ExecutionMode::Inline && multi_thread {
        tokio::task::block_in_place(|| driver.handle(data))
    } else {
        driver.handle(data)
    }
}

/// Reads the client handshake and answers it.
///
/// When no proposed version is supported the client is told so and the
/// handshake fails.
pub async fn accept_handshake<S>(stream: &mut S) -> Result<ProtocolVersion, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let request = HandshakeRequest::decode(&buf).map_err(ServerError::Handshake)?;

    match request.negotiate() {
        Ok(version) => {
            stream.write_all(&encode_response(Some(version))).await?;
            Ok(version)
        }
        Err(e) => {
            tracing::debug!("Rejecting handshake: {}", e);
            stream.write_all(&encode_response(None)).await?;
            stream.flush().await?;
            Err(ServerError::Handshake(e))
        }
    }
}
