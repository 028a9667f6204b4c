//! JSON-RPC 2.0 protocol types for spindle-server.
//!
//! One request per line, one response per line. Commands that reach the
//! engine are answered asynchronously, but still with exactly one response
//! carrying the request's id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spindle_core::{Reply, SubmitError};

/// JSON-RPC 2.0 error codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The connection is shutting down and accepts no more commands.
    pub const QUEUE_CLOSED: i32 = -32000;
    /// The session can no longer receive replies.
    pub const REQUESTER_GONE: i32 = -32001;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request identifier, reused as the command's correlation id.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Response for a submission the connection refused.
    pub fn rejected(id: u64, err: &SubmitError) -> Self {
        let code = match err {
            SubmitError::QueueClosed => error_codes::QUEUE_CLOSED,
            SubmitError::InvalidRequester => error_codes::REQUESTER_GONE,
            SubmitError::InvalidInput { .. }
            | SubmitError::MissingSource
            | SubmitError::InputTooLarge { .. } => error_codes::INVALID_PARAMS,
        };
        Self::error(id, code, err.to_string())
    }

    /// Response carrying an engine reply.
    ///
    /// Script errors are results too: `{"status": "error", "value": ...}`.
    pub fn from_reply(reply: Reply) -> Self {
        let id = reply.id.as_u64();
        match serde_json::to_value(&reply.outcome) {
            Ok(result) => Self::success(id, result),
            Err(e) => Self::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Parameters for the `eval` method.
#[derive(Debug, Deserialize)]
pub struct EvalParams {
    /// Script source.
    pub source: String,
}
