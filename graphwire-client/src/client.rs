//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use graphwire_protocol::{ProtocolVersion, Request, Response};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Result of running a statement and pulling all of its records.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Metadata of the `RUN` summary.
    pub header: Map<String, Value>,
    pub records: Vec<Vec<Value>>,
    /// Metadata of the `PULL_ALL` summary.
    pub summary: Map<String, Value>,
}

/// High-level client for graphwire.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<ProtocolVersion, ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request(&self, request: Request) -> Result<Vec<Response>, ClientError> {
        let reply = self.conn.request(request).await?;
        check(reply)
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Initializes the session. Returns the server's metadata.
    pub async fn init(&self, auth: Option<Value>) -> Result<Map<String, Value>, ClientError> {
        let client_name = self
            .conn
            .config()
            .client_name
            .clone()
            .unwrap_or_else(|| concat!("graphwire-client/", env!("CARGO_PKG_VERSION")).to_string());

        let reply = self.request(Request::Init { client_name, auth }).await?;
        summary_metadata(reply)
    }

    /// Runs a statement without pulling its records.
    pub async fn run(
        &self,
        statement: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Result<Map<String, Value>, ClientError> {
        let reply = self
            .request(Request::Run {
                statement: statement.into(),
                parameters,
            })
            .await?;
        summary_metadata(reply)
    }

    /// Pulls all records of the last statement.
    pub async fn pull_all(&self) -> Result<(Vec<Vec<Value>>, Map<String, Value>), ClientError> {
        let reply = self.request(Request::PullAll).await?;
        split_records(reply)
    }

    /// Discards all records of the last statement.
    pub async fn discard_all(&self) -> Result<Map<String, Value>, ClientError> {
        let reply = self.request(Request::DiscardAll).await?;
        summary_metadata(reply)
    }

    /// Acknowledges a failure so the session accepts requests again.
    pub async fn ack_failure(&self) -> Result<(), ClientError> {
        self.request(Request::AckFailure).await?;
        Ok(())
    }

    /// Resets the session.
    pub async fn reset(&self) -> Result<(), ClientError> {
        self.request(Request::Reset).await?;
        Ok(())
    }

    /// Runs a statement and pulls its records in a single round trip.
    pub async fn query(
        &self,
        statement: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Result<QueryResult, ClientError> {
        let requests = [
            Request::Run {
                statement: statement.into(),
                parameters,
            },
            Request::PullAll,
        ];
        let mut replies = self.conn.exchange(&requests).await?.into_iter();

        let header = match replies.next() {
            Some(reply) => summary_metadata(check(reply)?)?,
            None => return Err(ClientError::UnexpectedResponse("missing RUN reply".into())),
        };
        let (records, summary) = match replies.next() {
            Some(reply) => split_records(check(reply)?)?,
            None => return Err(ClientError::UnexpectedResponse("missing PULL_ALL reply".into())),
        };

        Ok(QueryResult {
            header,
            records,
            summary,
        })
    }

    /// Sends several requests in one write and returns every reply as is.
    pub async fn pipeline(&self, requests: &[Request]) -> Result<Vec<Vec<Response>>, ClientError> {
        self.conn.exchange(requests).await
    }
}

/// Turns a failed or ignored reply into an error.
fn check(reply: Vec<Response>) -> Result<Vec<Response>, ClientError> {
    match reply.last() {
        Some(Response::Failure { code, message }) => Err(ClientError::ServerError {
            code: *code,
            message: message.clone(),
        }),
        Some(Response::Ignored) => Err(ClientError::Ignored),
        Some(_) => Ok(reply),
        None => Err(ClientError::UnexpectedResponse("empty reply".into())),
    }
}

fn summary_metadata(reply: Vec<Response>) -> Result<Map<String, Value>, ClientError> {
    match reply.into_iter().last() {
        Some(Response::Success { metadata }) => Ok(metadata),
        other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
    }
}

fn split_records(
    reply: Vec<Response>,
) -> Result<(Vec<Vec<Value>>, Map<String, Value>), ClientError> {
    let mut records = Vec::new();
    for response in reply {
        match response {
            Response::Record { fields } => records.push(fields),
            Response::Success { metadata } => return Ok((records, metadata)),
            other => return Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
    Err(ClientError::UnexpectedResponse("reply without summary".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphwire_protocol::ErrorCode;
    use graphwire_server::{
        ExecutionMode, LoopbackSession, Server, ServerConfig, TransportConfig,
    };
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn start_server(execution: ExecutionMode) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig::new(addr).with_transport(TransportConfig {
            execution,
            ..TransportConfig::default()
        });
        let server = Arc::new(Server::new(config, LoopbackSession::factory()));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn connected(addr: SocketAddr) -> Client {
        let client = Client::new(ConnectionConfig::new(addr).with_client_name("tests"));
        assert_eq!(client.connect().await.unwrap(), ProtocolVersion::V1);
        client
    }

    #[test]
    fn test_client_creation() {
        let config = ConnectionConfig::new("127.0.0.1:7687".parse().unwrap());
        let client = Client::new(config);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_check_maps_failure() {
        let reply = vec![Response::failure(ErrorCode::StatementFailed, "boom")];
        assert!(matches!(
            check(reply),
            Err(ClientError::ServerError {
                code: ErrorCode::StatementFailed,
                ..
            })
        ));
        assert!(matches!(check(vec![Response::Ignored]), Err(ClientError::Ignored)));
    }

    #[tokio::test]
    async fn test_init_and_query() {
        let (server, addr) = start_server(ExecutionMode::Worker).await;
        let client = connected(addr).await;

        let metadata = client.init(None).await.unwrap();
        assert!(metadata["server"].as_str().unwrap().starts_with("graphwire/"));

        let mut parameters = Map::new();
        parameters.insert("limit".into(), json!(10));
        let result = client.query("MATCH (n) RETURN n", parameters).await.unwrap();

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0][0], "MATCH (n) RETURN n");
        assert_eq!(result.records[0][1], json!({"limit": 10}));
        assert_eq!(result.header["fields"], json!(["statement", "parameters"]));

        client.close().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_failure_then_ack() {
        let (server, addr) = start_server(ExecutionMode::Inline).await;
        let client = connected(addr).await;

        let err = client.run("   ", Map::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ServerError {
                code: ErrorCode::StatementFailed,
                ..
            }
        ));

        assert!(matches!(client.discard_all().await, Err(ClientError::Ignored)));
        client.ack_failure().await.unwrap();

        client.run("RETURN 1", Map::new()).await.unwrap();
        let (records, _) = client.pull_all().await.unwrap();
        assert_eq!(records.len(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_pipeline_many_requests() {
        let (server, addr) = start_server(ExecutionMode::Worker).await;
        let client = connected(addr).await;

        let mut requests = Vec::new();
        for i in 0..100 {
            requests.push(Request::run(format!("RETURN {}", i)));
            requests.push(Request::PullAll);
        }
        let replies = client.pipeline(&requests).await.unwrap();

        assert_eq!(replies.len(), 200);
        for (i, pair) in replies.chunks(2).enumerate() {
            match &pair[1][0] {
                Response::Record { fields } => {
                    assert_eq!(fields[0], format!("RETURN {}", i).as_str())
                }
                other => panic!("expected record, got {:?}", other),
            }
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reset_clears_pending_result() {
        let (server, addr) = start_server(ExecutionMode::Worker).await;
        let client = connected(addr).await;

        client.run("RETURN 1", Map::new()).await.unwrap();
        client.reset().await.unwrap();
        let err = client.pull_all().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ServerError {
                code: ErrorCode::InvalidRequest,
                ..
            }
        ));
        server.shutdown();
    }
}
