//! # graphwire-client
//!
//! Client library for graphwire.
//!
//! This crate provides:
//! - Async TCP connection with version negotiation
//! - Chunked request encoding and response reassembly
//! - Pipelined exchanges: many requests in one write, replies read in order
//! - High-level API for the session requests

pub mod client;
pub mod connection;
pub mod error;

pub use client::{Client, QueryResult};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
