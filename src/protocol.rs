//! Wire Message Types
//!
//! Every line on the channel is exactly one of these shapes:
//! - Request: `{"id": 1, "method": "query.run", "params": {...}}`
//! - Response: `{"id": 1, "result": {...}}` or `{"id": 1, "error": {"message": "...", "code": "..."}}`
//! - Notification: `{"method": "query.result", "params": {...}}`
//!
//! Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::JsonRow;
use crate::error::BridgeError;

/// Notification method names
pub mod notify {
    pub const BRIDGE_READY: &str = "bridge.ready";
    pub const QUERY_STARTED: &str = "query.started";
    pub const QUERY_RESULT: &str = "query.result";
    pub const QUERY_PROGRESS: &str = "query.progress";
    pub const QUERY_DONE: &str = "query.done";
}

/// Incoming request
///
/// A request without an `id` is a client notification and receives no response.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self { id: Some(id.into()), method: method.into(), params: Some(params) }
    }

    /// Params object, or `Null` when the caller sent none
    #[must_use]
    pub fn params(&self) -> &Value {
        self.params.as_ref().unwrap_or(&Value::Null)
    }
}

/// Outgoing response, echoing the request id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    #[must_use]
    pub fn failure(id: Value, err: &BridgeError) -> Self {
        Self { id, result: None, error: Some(ErrorInfo::from_error(err)) }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable error message (no credentials)
    pub message: String,

    /// Stable error code (e.g., "NOT_FOUND", "BUSY")
    pub code: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { message: message.into(), code: code.into() }
    }

    #[must_use]
    pub fn from_error(err: &BridgeError) -> Self {
        Self::new(err.error_code(), err.message())
    }
}

/// Outgoing notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification<P> {
    pub method: String,
    pub params: P,
}

impl<P: Serialize> Notification<P> {
    pub fn new(method: &str, params: P) -> Self {
        Self { method: method.to_string(), params }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyParams {
    pub pid: u32,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStarted {
    pub session_id: String,
    pub query_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub session_id: String,
    pub query_id: String,
    pub batch_index: u64,
    pub columns: Vec<String>,
    pub rows: Vec<JsonRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProgress {
    pub session_id: String,
    pub query_id: String,
    pub rows_so_far: u64,
    pub batches: u64,
    pub elapsed_ms: u64,
}

/// Terminal notification, emitted exactly once per started query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDone {
    pub session_id: String,
    pub query_id: String,
    pub ok: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub total_rows: u64,
    pub total_batches: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}
