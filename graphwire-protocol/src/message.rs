//! Request and response messages carried inside chunked frames.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Initializes the session.
    Init {
        client_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<Value>,
    },

    /// Runs a statement; results are fetched with `PULL_ALL` or dropped with
    /// `DISCARD_ALL`.
    Run {
        statement: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },

    /// Streams all pending records of the last statement.
    PullAll,

    /// Discards all pending records of the last statement.
    DiscardAll,

    /// Acknowledges a failure so the session accepts requests again.
    AckFailure,

    /// Resets the session to a clean state.
    Reset,
}

impl Request {
    pub fn init(client_name: impl Into<String>) -> Self {
        Request::Init {
            client_name: client_name.into(),
            auth: None,
        }
    }

    pub fn run(statement: impl Into<String>) -> Self {
        Request::Run {
            statement: statement.into(),
            parameters: Map::new(),
        }
    }

    /// Adds a parameter to a `RUN` request. Other requests are unchanged.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Request::Run { parameters, .. } = &mut self {
            parameters.insert(key.into(), value.into());
        }
        self
    }

    /// Returns the wire name of this request.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "INIT",
            Request::Run { .. } => "RUN",
            Request::PullAll => "PULL_ALL",
            Request::DiscardAll => "DISCARD_ALL",
            Request::AckFailure => "ACK_FAILURE",
            Request::Reset => "RESET",
        }
    }
}

/// Server response messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    /// Request completed.
    Success {
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// One result record.
    Record { fields: Vec<Value> },

    /// Request skipped because the session is in a failed state.
    Ignored,

    /// Request failed.
    Failure { code: ErrorCode, message: String },
}

impl Response {
    pub fn success() -> Self {
        Response::Success {
            metadata: Map::new(),
        }
    }

    pub fn record(fields: Vec<Value>) -> Self {
        Response::Record { fields }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Failure {
            code,
            message: message.into(),
        }
    }

    /// Adds a metadata entry to a `SUCCESS` response. Other responses are
    /// unchanged.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Response::Success { metadata } = &mut self {
            metadata.insert(key.into(), value.into());
        }
        self
    }

    /// Returns whether this response ends the reply to a request.
    pub fn is_summary(&self) -> bool {
        !matches!(self, Response::Record { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::run("MATCH (n) RETURN n").with_parameter("limit", 10);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"RUN""#));
        assert!(json.contains(r#""limit":10"#));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_unit_request_serialization() {
        let json = serde_json::to_string(&Request::PullAll).unwrap();
        assert_eq!(json, r#"{"type":"PULL_ALL"}"#);

        let parsed: Request = serde_json::from_str(r#"{"type":"ACK_FAILURE"}"#).unwrap();
        assert_eq!(parsed, Request::AckFailure);
    }

    #[test]
    fn test_run_without_parameters() {
        let parsed: Request =
            serde_json::from_str(r#"{"type":"RUN","statement":"RETURN 1"}"#).unwrap();
        assert_eq!(parsed, Request::run("RETURN 1"));
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::failure(ErrorCode::StatementFailed, "boom");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"FAILURE""#));
        assert!(json.contains(r#""code":"STATEMENT_FAILED""#));

        let resp = Response::success().with_metadata("fields", vec!["n"]);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""fields":["n"]"#));
    }

    #[test]
    fn test_summary_classification() {
        assert!(Response::success().is_summary());
        assert!(Response::Ignored.is_summary());
        assert!(!Response::record(vec![]).is_summary());
        assert!(Response::failure(ErrorCode::InternalError, "x").is_failure());
    }

    #[test]
    fn test_request_names() {
        assert_eq!(Request::init("c").name(), "INIT");
        assert_eq!(Request::Reset.name(), "RESET");
        assert_eq!(Request::DiscardAll.name(), "DISCARD_ALL");
    }
}
