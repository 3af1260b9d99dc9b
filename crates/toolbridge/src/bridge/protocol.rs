//! Wire protocol types.
//!
//! Two surfaces:
//! - **RPC** (framed, caller-facing): requests, responses and error objects
//! - **Worker sub-protocol** (newline-delimited, internal): `{id, operation, data}`
//!   to the worker, `{id, result}` or `{id, error}` back

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Caller-chosen request identifier. Numbers are echoed back exactly as
/// received, fractional or beyond `i64` included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Inbound request. A missing (or null) `id` makes it a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Outbound response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResponseBody {
    #[serde(rename = "result")]
    Success(Value),
    #[serde(rename = "error")]
    Failure(RpcError),
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            body: ResponseBody::Success(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            body: ResponseBody::Failure(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Failure(_))
    }
}

/// Error object with a code from the fixed set below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const APPLICATION: i64 = -32000;

    pub fn method_not_found() -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
        }
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: format!("Invalid params: {detail}"),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self {
            code: Self::APPLICATION,
            message: message.into(),
        }
    }
}

/// Request written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub operation: String,
    pub data: Value,
}

/// Reply read from the worker's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerFault>,
}

/// Error payload echoed by the worker. Workers in the wild send either a bare
/// message string or a `{code, message}` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerFault {
    Message(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
        message: String,
    },
    Other(Value),
}

impl WorkerFault {
    pub fn message(&self) -> String {
        match self {
            Self::Message(message) | Self::Detailed { message, .. } => message.clone(),
            Self::Other(value) => value.to_string(),
        }
    }
}

impl WorkerReply {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(WorkerFault::Message(message.into())),
        }
    }

    /// Outcome carried by the reply. A reply with neither field resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.error {
            Some(fault) => Err(fault.message()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
