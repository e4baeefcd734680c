//! Connection management.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use graphwire_protocol::handshake::{decode_response, HANDSHAKE_RESPONSE_SIZE};
use graphwire_protocol::{
    encode_message, Dechunker, HandshakeRequest, JsonFormat, MessageFormat, ProtocolError,
    ProtocolVersion, Request, Response,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout, including the handshake.
    pub connect_timeout: Duration,
    /// Time allowed for all replies of one exchange.
    pub request_timeout: Duration,
    /// Client name sent with `INIT`.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Versions proposed during the handshake, most preferred first.
    pub proposals: [u32; 4],
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            proposals: HandshakeRequest::supported().proposals,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    /// Overrides the proposed protocol versions.
    pub fn with_proposals(mut self, proposals: [u32; 4]) -> Self {
        self.proposals = proposals;
        self
    }
}

/// Socket halves plus the reassembly state of the inbound stream.
struct Io {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    dechunker: Dechunker,
    inbox: VecDeque<Bytes>,
    buf: Vec<u8>,
}

impl Io {
    async fn next_response(&mut self, format: &dyn MessageFormat) -> Result<Response, ClientError> {
        loop {
            if let Some(payload) = self.inbox.pop_front() {
                return Ok(format.decode_response(&payload)?);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                tracing::debug!("Connection closed by server");
                return Err(ClientError::ConnectionClosed);
            }
            tracing::trace!("Read {} bytes from socket", n);

            let Io {
                dechunker,
                inbox,
                buf,
                ..
            } = self;
            dechunker.feed(&buf[..n], |payload| {
                inbox.push_back(payload);
                Ok::<_, ProtocolError>(())
            })?;
        }
    }

    /// Reads the responses answering one request: any records followed by
    /// a summary.
    async fn read_reply(&mut self, format: &dyn MessageFormat) -> Result<Vec<Response>, ClientError> {
        let mut reply = Vec::new();
        loop {
            let response = self.next_response(format).await?;
            let done = response.is_summary();
            reply.push(response);
            if done {
                return Ok(reply);
            }
        }
    }
}

/// A connection to a graphwire server.
///
/// Requests are answered strictly in order, so an exchange holds the
/// connection from the first write until its last summary is read.
pub struct Connection {
    config: ConnectionConfig,
    format: Arc<dyn MessageFormat>,
    io: Mutex<Option<Io>>,
    /// Negotiated version number, `0` before the handshake.
    version: AtomicU32,
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            format: Arc::new(JsonFormat::new()),
            io: Mutex::new(None),
            version: AtomicU32::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Uses a message format other than JSON.
    pub fn with_format(mut self, format: Arc<dyn MessageFormat>) -> Self {
        self.format = format;
        self
    }

    /// Connects to the server and negotiates the protocol version.
    pub async fn connect(&self) -> Result<ProtocolVersion, ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let (stream, version) = tokio::time::timeout(self.config.connect_timeout, async {
            let mut stream = TcpStream::connect(self.config.addr).await?;
            stream.set_nodelay(true).ok();
            let version = handshake(&mut stream, self.config.proposals).await?;
            Ok::<_, ClientError>((stream, version))
        })
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })??;

        tracing::debug!("Handshake complete, using protocol {}", version);
        let (reader, writer) = stream.into_split();
        *self.io.lock().await = Some(Io {
            reader,
            writer,
            dechunker: Dechunker::new(),
            inbox: VecDeque::new(),
            buf: vec![0u8; self.config.read_buffer_size],
        });
        self.version.store(version.number(), Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        Ok(version)
    }

    /// Sends `requests` in one write and reads one reply per request.
    ///
    /// The connection is dropped when the exchange fails part way, since
    /// the remaining replies can no longer be matched to requests.
    pub async fn exchange(&self, requests: &[Request]) -> Result<Vec<Vec<Response>>, ClientError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let mut out = BytesMut::new();
        let mut payload = Vec::new();
        for request in requests {
            payload.clear();
            self.format.encode_request(request, &mut payload)?;
            encode_message(&payload, &mut out);
        }
        tracing::debug!("Sending {} request(s) ({} bytes)", requests.len(), out.len());

        let format = self.format.as_ref();
        let result = tokio::time::timeout(self.config.request_timeout, async {
            io.writer.write_all(&out).await?;
            let mut replies = Vec::with_capacity(requests.len());
            for _ in requests {
                replies.push(io.read_reply(format).await?);
            }
            Ok::<_, ClientError>(replies)
        })
        .await
        .unwrap_or(Err(ClientError::Timeout));

        if let Err(ref e) = result {
            tracing::debug!("Exchange failed, dropping connection: {}", e);
            guard.take();
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Sends one request and reads its reply.
    pub async fn request(&self, request: Request) -> Result<Vec<Response>, ClientError> {
        self.exchange(std::slice::from_ref(&request))
            .await?
            .pop()
            .ok_or_else(|| ClientError::UnexpectedResponse("empty reply".to_string()))
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the negotiated protocol version.
    pub fn version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_number(self.version.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut io) = self.io.lock().await.take() {
            tracing::debug!("Shutting down writer");
            io.writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Sends the client handshake and reads the server's choice.
async fn handshake<S>(stream: &mut S, proposals: [u32; 4]) -> Result<ProtocolVersion, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = HandshakeRequest::new(proposals);
    stream.write_all(&request.encode()).await?;

    let mut answer = [0u8; HANDSHAKE_RESPONSE_SIZE];
    stream.read_exact(&mut answer).await?;
    decode_response(answer).map_err(ClientError::Handshake)
}
