//! JSON-RPC 2.0 message types for the MCP wire protocol.
//!
//! Every message on either boundary of the gateway — the upstream client on
//! standard I/O and the downstream servers behind it — is a single
//! newline-delimited JSON object. This module owns the envelope types, the
//! error-code constants, and the classification of raw inbound lines into
//! requests and notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MCP protocol version this gateway targets.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name advertised during initialisation.
pub const SERVER_NAME: &str = "switchboard-mcp";

/// Method used for catalog-change notifications to the client.
pub const UPDATE_TOOLS_METHOD: &str = "update/tools";

/// JSON-RPC 2.0 error codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters, including admin constraint violations.
    InvalidParams,
    /// Internal error, including upstream timeouts and closed sessions.
    InternalError,
}

impl ErrorCode {
    /// The numeric wire value of this error code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
        }
    }
}

/// A request identifier: JSON-RPC permits both integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC 2.0 request (carries an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request with a numeric id.
    #[must_use]
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id` — fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a notification without parameters.
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }

    /// Creates a notification with parameters.
    #[must_use]
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Creates the `update/tools` notification with a summary message.
    #[must_use]
    pub fn update_tools(message: impl Into<String>) -> Self {
        Self::with_params(
            UPDATE_TOOLS_METHOD,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// A JSON-RPC 2.0 success or error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Whether the response carries an error object.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extracts the result value, or the error object if the reply failed.
    ///
    /// # Errors
    ///
    /// Returns the wire error object when the response is an error.
    pub fn into_result(self) -> Result<Value, JsonRpcErrorData> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Rebinds this response to a different request id.
    ///
    /// Used when relaying a downstream reply verbatim under the upstream
    /// client's id.
    #[must_use]
    pub fn with_id(self, id: RequestId) -> Self {
        Self { id, ..self }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates an error object from a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcErrorData {}

/// An outbound error reply.
///
/// Unlike [`JsonRpcResponse`] the id is optional: a parse error is replied
/// to with `id = null` because the offending line never yielded one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Creates an error reply.
    #[must_use]
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            error,
        }
    }

    /// `-32700` reply for a line that was not valid JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, JsonRpcErrorData::new(ErrorCode::ParseError, "Parse error"))
    }

    /// `-32600` reply for a malformed envelope.
    #[must_use]
    pub fn invalid_request(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorCode::InvalidRequest, message),
        )
    }

    /// `-32601` reply for an unknown method or tool.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorCode::MethodNotFound, format!("Method not found: {method}")),
        )
    }

    /// `-32602` reply for invalid parameters or admin constraint violations.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorCode::InvalidParams, message),
        )
    }

    /// `-32603` reply for internal failures, including upstream errors.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorCode::InternalError, message),
        )
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A request that must be answered.
    Request(JsonRpcRequest),
    /// A notification that must not be answered.
    Notification(JsonRpcNotification),
}

/// Why an inbound line produced no [`IncomingMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// The line deserves an error reply.
    Reply(Box<JsonRpcError>),
    /// The line is dropped: notifications cannot be replied to.
    Drop(String),
}

/// Classifies one raw line into a request or notification.
///
/// Parse failures yield a `-32700` reply with a null id. An envelope whose
/// `jsonrpc` member is missing or not `"2.0"` yields a `-32600` reply when
/// the message carries an id, and is dropped otherwise.
///
/// # Errors
///
/// Returns [`EnvelopeError::Reply`] when an error response must be written,
/// or [`EnvelopeError::Drop`] when the line is silently discarded.
pub fn parse_message(line: &str) -> Result<IncomingMessage, EnvelopeError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|_| EnvelopeError::Reply(Box::new(JsonRpcError::parse_error())))?;

    let id = value.get("id").and_then(|id| match id {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) => Some(RequestId::String(s.clone())),
        _ => None,
    });

    let version_ok = value.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
    let method = value.get("method").and_then(Value::as_str);

    if !version_ok || method.is_none() {
        return match id {
            Some(id) => Err(EnvelopeError::Reply(Box::new(JsonRpcError::invalid_request(
                id,
                "Invalid request: expected a JSON-RPC 2.0 request object",
            )))),
            None => Err(EnvelopeError::Drop(
                "invalid envelope without id".to_string(),
            )),
        };
    }

    let method = method.unwrap_or_default().to_string();
    let params = value.get("params").cloned();

    match id {
        Some(id) => Ok(IncomingMessage::Request(JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id,
            method,
            params,
        })),
        None => Ok(IncomingMessage::Notification(JsonRpcNotification {
            jsonrpc: "2.0".into(),
            method,
            params,
        })),
    }
}

/// A tool as described by a downstream server.
///
/// Only the members the gateway rewrites are modelled; everything else is
/// carried through `extra` untouched so richer descriptors survive the trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// The result payload of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
