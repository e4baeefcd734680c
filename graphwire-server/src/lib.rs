//! # graphwire-server
//!
//! TCP server for graphwire.
//!
//! This crate provides:
//! - The per-connection [`ProtocolDriver`] that reassembles chunked input
//!   and owns the close sequence
//! - The [`MessageBridge`] running requests inline or on a worker thread
//! - Flush coordination so pipelined responses share a send
//! - The session seam and a loopback session for tests and demos
//! - Configuration, Prometheus metrics and the accept loop

pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod server;
pub mod session;
pub mod socket;

pub use bridge::MessageBridge;
pub use config::{Config, ConfigError, ExecutionMode, MetricsConfig, NetworkConfig, TransportConfig};
pub use driver::{DriverBuilder, ProtocolDriver};
pub use error::ServerError;
pub use flush::{CompletionGuard, FaultReceiver, FlushCoordinator};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{accept_handshake, Server, ServerConfig, ServerStats};
pub use session::{ConnectionInfo, LoopbackSession, Session, SessionError, SessionFactory};
pub use socket::SocketChannel;
