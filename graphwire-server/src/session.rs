//! Session layer collaborators.
//!
//! A [`Session`] executes decoded requests for one connection. The framing
//! layer never looks inside requests; it only needs the responses to encode
//! and whether a failure should end the connection.

use graphwire_protocol::{ErrorCode, ProtocolVersion, Request, Response};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Failure while executing a request.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
    /// The connection must close after reporting this failure.
    pub fatal: bool,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    /// Creates a failure that ends the connection.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
        }
    }
}

/// Executes requests for one connection.
///
/// Calls arrive in request order from a single thread at a time.
pub trait Session: Send {
    /// Executes one request, returning the responses to send in order.
    fn execute(&mut self, request: Request) -> Result<Vec<Response>, SessionError>;

    /// Releases session resources. Called once, after the last request.
    fn close(&mut self);
}

/// Identity of an accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub version: ProtocolVersion,
}

/// Opens a session for each accepted connection.
pub trait SessionFactory: Send + Sync {
    fn open(&self, info: &ConnectionInfo) -> Box<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(&ConnectionInfo) -> Box<dyn Session> + Send + Sync,
{
    fn open(&self, info: &ConnectionInfo) -> Box<dyn Session> {
        self(info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopbackState {
    Ready,
    /// A request failed; everything is ignored until acknowledged.
    Failed,
    Closed,
}

/// Session that echoes statements back as records.
///
/// `RUN` stores the statement and its parameters, `PULL_ALL` returns them
/// as a single record. An empty statement fails, after which requests are
/// answered with `IGNORED` until `ACK_FAILURE` or `RESET`.
#[derive(Debug)]
pub struct LoopbackSession {
    state: LoopbackState,
    client_name: Option<String>,
    pending: Option<(String, Map<String, Value>)>,
    executed: u64,
}

impl LoopbackSession {
    pub fn new() -> Self {
        Self {
            state: LoopbackState::Ready,
            client_name: None,
            pending: None,
            executed: 0,
        }
    }

    /// Returns a factory producing loopback sessions.
    pub fn factory() -> impl SessionFactory {
        |info: &ConnectionInfo| -> Box<dyn Session> {
            tracing::debug!("[{}] Opening loopback session {}", info.remote_addr, info.id);
            Box::new(LoopbackSession::new())
        }
    }

    /// Returns the client name sent with `INIT`.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Returns the number of requests executed.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn fail(&mut self, err: SessionError) -> Result<Vec<Response>, SessionError> {
        self.state = LoopbackState::Failed;
        self.pending = None;
        Err(err)
    }
}

impl Default for LoopbackSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for LoopbackSession {
    fn execute(&mut self, request: Request) -> Result<Vec<Response>, SessionError> {
        self.executed += 1;

        match (self.state, request) {
            (LoopbackState::Closed, _) => Err(SessionError::fatal(
                ErrorCode::SessionClosed,
                "session is closed",
            )),
            (_, Request::Reset) => {
                self.state = LoopbackState::Ready;
                self.pending = None;
                Ok(vec![Response::success()])
            }
            (LoopbackState::Failed, Request::AckFailure) => {
                self.state = LoopbackState::Ready;
                Ok(vec![Response::success()])
            }
            (LoopbackState::Failed, _) => Ok(vec![Response::Ignored]),
            (LoopbackState::Ready, Request::AckFailure) => {
                self.fail(SessionError::new(
                    ErrorCode::InvalidRequest,
                    "no failure to acknowledge",
                ))
            }
            (LoopbackState::Ready, Request::Init { client_name, .. }) => {
                self.client_name = Some(client_name);
                Ok(vec![Response::success()
                    .with_metadata("server", concat!("graphwire/", env!("CARGO_PKG_VERSION")))])
            }
            (LoopbackState::Ready, Request::Run { statement, .. }) if statement.trim().is_empty() => {
                self.fail(SessionError::new(
                    ErrorCode::StatementFailed,
                    "statement is empty",
                ))
            }
            (LoopbackState::Ready, Request::Run { statement, parameters }) => {
                self.pending = Some((statement, parameters));
                Ok(vec![
                    Response::success().with_metadata("fields", vec!["statement", "parameters"])
                ])
            }
            (LoopbackState::Ready, Request::PullAll) => match self.pending.take() {
                Some((statement, parameters)) => Ok(vec![
                    Response::record(vec![Value::String(statement), Value::Object(parameters)]),
                    Response::success(),
                ]),
                None => self.fail(SessionError::new(
                    ErrorCode::InvalidRequest,
                    "no result to pull",
                )),
            },
            (LoopbackState::Ready, Request::DiscardAll) => {
                self.pending = None;
                Ok(vec![Response::success()])
            }
        }
    }

    fn close(&mut self) {
        self.state = LoopbackState::Closed;
        self.pending = None;
    }
}
