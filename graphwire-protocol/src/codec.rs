//! Pluggable message formats.
//!
//! The framing layer treats message payloads as opaque bytes. A
//! [`MessageFormat`] turns those bytes into [`Request`]/[`Response`] values
//! and back, streaming encoded output straight into any `io::Write` (such as
//! a [`ChunkWriter`](crate::ChunkWriter)).

use crate::error::ProtocolError;
use crate::message::{Request, Response};
use std::io;

/// Serialization format for message payloads.
pub trait MessageFormat: Send + Sync {
    /// Returns a short name for logging.
    fn name(&self) -> &'static str;

    fn decode_request(&self, payload: &[u8]) -> Result<Request, ProtocolError>;

    fn encode_response(
        &self,
        response: &Response,
        out: &mut dyn io::Write,
    ) -> Result<(), ProtocolError>;

    fn encode_request(&self, request: &Request, out: &mut dyn io::Write)
        -> Result<(), ProtocolError>;

    fn decode_response(&self, payload: &[u8]) -> Result<Response, ProtocolError>;
}

/// JSON message format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl JsonFormat {
    pub fn new() -> Self {
        Self
    }
}

impl MessageFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode_request(&self, payload: &[u8]) -> Result<Request, ProtocolError> {
        serde_json::from_slice(payload).map_err(decode_error)
    }

    fn encode_response(
        &self,
        response: &Response,
        out: &mut dyn io::Write,
    ) -> Result<(), ProtocolError> {
        serde_json::to_writer(out, response).map_err(encode_error)
    }

    fn encode_request(
        &self,
        request: &Request,
        out: &mut dyn io::Write,
    ) -> Result<(), ProtocolError> {
        serde_json::to_writer(out, request).map_err(encode_error)
    }

    fn decode_response(&self, payload: &[u8]) -> Result<Response, ProtocolError> {
        serde_json::from_slice(payload).map_err(decode_error)
    }
}

fn decode_error(err: serde_json::Error) -> ProtocolError {
    ProtocolError::Decode(err.to_string())
}

/// Keeps output failures distinguishable from serialization failures.
fn encode_error(err: serde_json::Error) -> ProtocolError {
    if err.is_io() {
        ProtocolError::Io(err.into())
    } else {
        ProtocolError::Json(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::chunk::ChunkWriter;
    use crate::dechunk::Dechunker;
    use crate::error::ErrorCode;
    use std::sync::Arc;

    #[test]
    fn test_json_request_roundtrip() {
        let format = JsonFormat::new();
        let request = Request::run("RETURN $x").with_parameter("x", 1);

        let mut buf = Vec::new();
        format.encode_request(&request, &mut buf).unwrap();
        assert_eq!(format.decode_request(&buf).unwrap(), request);
    }

    #[test]
    fn test_json_response_roundtrip() {
        let format = JsonFormat::new();
        let response = Response::failure(ErrorCode::InvalidRequest, "nope");

        let mut buf = Vec::new();
        format.encode_response(&response, &mut buf).unwrap();
        assert_eq!(format.decode_response(&buf).unwrap(), response);
    }

    #[test]
    fn test_invalid_payload_is_decode_error() {
        let format = JsonFormat::new();
        let result = format.decode_request(b"\x01\x02 not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));

        let result = format.decode_request(br#"{"type":"UNKNOWN"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_encode_through_chunk_writer() {
        let format = JsonFormat::new();
        let channel = Arc::new(MemoryChannel::new());
        let mut writer = ChunkWriter::new(channel.clone());

        let response = Response::record(vec![serde_json::json!("x".repeat(100_000))]);
        format.encode_response(&response, &mut writer).unwrap();
        writer.message_succeeded().unwrap();
        writer.flush().unwrap();

        let mut dechunker = Dechunker::new();
        let mut payloads = Vec::new();
        dechunker
            .feed(&channel.contents(), |payload| {
                payloads.push(payload);
                Ok::<_, ProtocolError>(())
            })
            .unwrap();

        assert_eq!(payloads.len(), 1);
        assert_eq!(format.decode_response(&payloads[0]).unwrap(), response);
    }

    #[test]
    fn test_output_failure_is_io_error() {
        let format = JsonFormat::new();
        let channel = Arc::new(MemoryChannel::new());
        let mut writer = ChunkWriter::with_capacity(channel.clone(), 16);
        channel.fail_writes();

        let response = Response::record(vec![serde_json::json!("y".repeat(1_000))]);
        let result = format.encode_response(&response, &mut writer);
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
