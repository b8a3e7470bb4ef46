//! JSON-RPC 2.0 message types and codec for the MCP protocol.
//!
//! This module defines the wire envelope used in the Model Context Protocol
//! and the [`decode`]/[`encode`] pair that every transport feeds.
//!
//! # Message Types
//!
//! - **Request**: A message expecting a response (has `method` and `id`)
//! - **Response**: A reply to a request (has `id` and exactly one of `result`/`error`)
//! - **Notification**: A one-way message (has `method`, no `id`)
//!
//! # MCP-Specific Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - Request IDs must be unique within a session
//! - Messages larger than the configured maximum are rejected before parsing

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mcp::error::{McpError, McpResult};

/// The JSON-RPC version string every envelope must carry.
pub const JSONRPC_VERSION: &str = "2.0";

/// The MCP protocol version this implementation supports.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Default cap on the serialised size of a single message (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Standard MCP method names.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// List tools.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool.
    pub const TOOLS_CALL: &str = "tools/call";
    /// List resources.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Read a resource.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Subscribe to resource updates.
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    /// Unsubscribe from resource updates.
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    /// List prompts.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Render a prompt.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Set the minimum log level for `notifications/message`.
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    /// Cancel an in-flight request.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Progress for an in-flight request.
    pub const PROGRESS: &str = "notifications/progress";
    /// Log message from the peer.
    pub const MESSAGE: &str = "notifications/message";
    /// Subscribed resource changed.
    pub const RESOURCE_UPDATED: &str = "notifications/resources/updated";
    /// Tool catalog changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Resource catalog changed.
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// Prompt catalog changed.
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

/// A JSON-RPC 2.0 request ID.
///
/// MCP request IDs must be strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
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

impl RequestId {
    /// Interprets a JSON value as a request ID.
    ///
    /// Returns `None` for `null`, floats, and non-scalar values.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// Unique request identifier.
    pub id: RequestId,

    /// The method to invoke.
    pub method: String,

    /// Optional parameters for the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification message.
///
/// Notifications do not have an ID and never receive a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Creates a progress notification.
    #[must_use]
    pub fn progress(progress_token: Value, progress: f64, total: Option<f64>, message: Option<&str>) -> Self {
        let mut params = Map::new();
        params.insert("progressToken".into(), progress_token);
        params.insert("progress".into(), progress.into());
        if let Some(total) = total {
            params.insert("total".into(), total.into());
        }
        if let Some(message) = message {
            params.insert("message".into(), message.into());
        }
        Self::new(methods::PROGRESS, Some(Value::Object(params)))
    }
}

/// Standard JSON-RPC 2.0 error codes plus the MCP-specific ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Tool, resource or prompt not found.
    NotFound,
    /// The request could not be completed (timeout, connection, transport).
    RequestFailed,
    /// The request was cancelled.
    Cancelled,
    /// Any other code.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::NotFound => -32001,
            Self::RequestFailed => -32002,
            Self::Cancelled => -32800,
            Self::ServerError(code) => code,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::NotFound => "Not found",
            Self::RequestFailed => "Request failed",
            Self::Cancelled => "Request cancelled",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The outcome carried by a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    /// Successful result.
    Result(Value),
    /// Error object.
    Error(JsonRpcErrorData),
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: String,

    /// The request ID this response corresponds to; `null` when it could not be determined.
    pub id: Option<RequestId>,

    /// The result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Creates a new error response.
    #[must_use]
    pub fn failure(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Converts the payload into a result, mapping error objects to [`McpError`].
    ///
    /// # Errors
    ///
    /// Returns the peer's error when the payload is an error object.
    pub fn into_result(self) -> McpResult<Value> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(McpError::from_error_object(&error)),
        }
    }
}

/// Any JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A response to an earlier request.
    Response(JsonRpcResponse),
    /// A notification (no response expected).
    Notification(JsonRpcNotification),
}

impl Message {
    /// Returns the method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) => None,
        }
    }

    /// Returns the message ID for requests and responses.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => resp.id.as_ref(),
            Self::Notification(_) => None,
        }
    }
}

/// A message that failed decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// The ID of the offending message, if one could be recovered.
    pub id: Option<RequestId>,
    /// What was wrong with it.
    pub error: McpError,
    /// Whether the peer should receive an error response.
    ///
    /// Malformed responses are dropped rather than answered, so two
    /// misbehaving peers cannot bounce errors back and forth.
    pub respond: bool,
}

impl DecodeError {
    fn new(id: Option<RequestId>, error: McpError) -> Self {
        Self {
            id,
            error,
            respond: true,
        }
    }

    fn silent(mut self) -> Self {
        self.respond = false;
        self
    }

    /// Builds the error response to send back to the peer.
    #[must_use]
    pub fn to_response(&self) -> JsonRpcResponse {
        JsonRpcResponse::failure(self.id.clone(), self.error.to_error_object())
    }
}

fn invalid(id: Option<RequestId>, message: &str) -> DecodeError {
    DecodeError::new(id, McpError::invalid_request(message))
}

/// Decodes and classifies one serialised message.
///
/// A payload with `method` and `id` is a request, `method` without `id` is a
/// notification, and an `id` with exactly one of `result`/`error` is a
/// response. Anything else is an invalid request.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the payload exceeds `max_size`, is not JSON,
/// or is not a valid JSON-RPC 2.0 message.
pub fn decode(raw: &str, max_size: usize) -> Result<Message, DecodeError> {
    if raw.len() > max_size {
        return Err(invalid(
            None,
            &format!("message of {} bytes exceeds the {max_size} byte limit", raw.len()),
        ));
    }

    let value: Value = serde_json::from_str(raw).map_err(|e| {
        DecodeError::new(
            None,
            McpError::Parse {
                message: e.to_string(),
            },
        )
    })?;

    let Value::Object(mut obj) = value else {
        return Err(invalid(None, "message must be a JSON object"));
    };

    let raw_id = obj.remove("id");
    let id = raw_id.as_ref().and_then(RequestId::from_value);
    if let Some(raw_id) = &raw_id {
        if id.is_none() && !raw_id.is_null() {
            return Err(invalid(None, "id must be a string or an integer"));
        }
    }

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid(id, "jsonrpc field must be \"2.0\""));
    }

    let result = obj.remove("result");
    let error = obj.remove("error");

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(invalid(id, "method field must be a string"));
        };
        if method.is_empty() {
            return Err(invalid(id, "method field cannot be empty"));
        }
        if result.is_some() || error.is_some() {
            return Err(invalid(id, "a request cannot carry result or error"));
        }
        let params = match obj.remove("params") {
            None | Some(Value::Null) => None,
            Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
            Some(_) => return Err(invalid(id, "params must be an object or an array")),
        };

        return match (raw_id, id) {
            (None, _) => Ok(Message::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            })),
            (Some(_), Some(id)) => Ok(Message::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                method,
                params,
            })),
            (Some(_), None) => Err(invalid(None, "request id must not be null")),
        };
    }

    if raw_id.is_none() {
        return Err(invalid(None, "message has neither method nor id"));
    }

    match (result, error) {
        (Some(_), Some(_)) => Err(invalid(id, "response cannot carry both result and error").silent()),
        (None, None) => Err(invalid(id, "response must carry result or error").silent()),
        (Some(result), None) => {
            let Some(id) = id else {
                return Err(invalid(None, "success response must carry a non-null id").silent());
            };
            Ok(Message::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(id),
                payload: ResponsePayload::Result(result),
            }))
        }
        (None, Some(error)) => {
            let error: JsonRpcErrorData = serde_json::from_value(error)
                .map_err(|_| invalid(id.clone(), "malformed error object").silent())?;
            Ok(Message::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                payload: ResponsePayload::Error(error),
            }))
        }
    }
}

/// Serialises a message to a single line of JSON.
///
/// # Errors
///
/// Returns an internal error if serialisation fails.
pub fn encode(message: &Message) -> McpResult<String> {
    serde_json::to_string(message).map_err(|e| McpError::internal(format!("failed to serialise message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = DEFAULT_MAX_MESSAGE_SIZE;

    #[test]
    fn parse_valid_request() {
        let json = r#"{"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}"#;
        let msg = decode(json, MAX).unwrap();

        let Message::Request(req) = msg else {
            panic!("Expected Request");
        };
        assert_eq!(req.id, RequestId::Number(1));
        assert_eq!(req.method, "initialize");
    }

    #[test]
    fn parse_valid_notification() {
        let json = r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#;
        let msg = decode(json, MAX).unwrap();

        let Message::Notification(notif) = msg else {
            panic!("Expected Notification");
        };
        assert_eq!(notif.method, "notifications/initialized");
    }

    #[test]
    fn parse_string_id() {
        let json = r#"{"jsonrpc": "2.0", "id": "abc-123", "method": "test"}"#;
        let msg = decode(json, MAX).unwrap();
        assert_eq!(msg.id(), Some(&RequestId::String("abc-123".to_string())));
    }

    #[test]
    fn parse_success_and_error_responses() {
        let ok = decode(r#"{"jsonrpc":"2.0","id":7,"result":{"x":1}}"#, MAX).unwrap();
        let Message::Response(resp) = ok else {
            panic!("Expected Response");
        };
        assert_eq!(resp.into_result().unwrap(), json!({"x": 1}));

        let err = decode(
            r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32601,"message":"Method not found"}}"#,
            MAX,
        )
        .unwrap();
        let Message::Response(resp) = err else {
            panic!("Expected Response");
        };
        assert!(matches!(resp.into_result(), Err(McpError::MethodNotFound { .. })));
    }

    #[test]
    fn reject_response_with_both_result_and_error() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":-32603,"message":"x"}}"#;
        let err = decode(json, MAX).unwrap_err();
        assert!(matches!(err.error, McpError::InvalidRequest { .. }));
        assert!(!err.respond);
    }

    #[test]
    fn parse_invalid_json() {
        let err = decode("not valid json", MAX).unwrap_err();
        assert_eq!(err.error.code(), ErrorCode::ParseError);
        assert!(err.id.is_none());
    }

    #[test]
    fn parse_missing_jsonrpc() {
        let err = decode(r#"{"id": 1, "method": "test"}"#, MAX).unwrap_err();
        assert_eq!(err.error.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.id, Some(RequestId::Number(1)));
    }

    #[test]
    fn parse_wrong_jsonrpc_version() {
        let err = decode(r#"{"jsonrpc": "1.0", "id": 1, "method": "test"}"#, MAX).unwrap_err();
        assert_eq!(err.error.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn reject_null_request_id_and_float_id() {
        assert!(decode(r#"{"jsonrpc":"2.0","id":null,"method":"x"}"#, MAX).is_err());
        assert!(decode(r#"{"jsonrpc":"2.0","id":1.5,"method":"x"}"#, MAX).is_err());
    }

    #[test]
    fn reject_scalar_params() {
        let err = decode(r#"{"jsonrpc":"2.0","id":1,"method":"x","params":3}"#, MAX).unwrap_err();
        assert!(err.respond);
        assert_eq!(err.id, Some(RequestId::Number(1)));
    }

    #[test]
    fn reject_oversized_before_parsing() {
        let json = format!(r#"{{"jsonrpc":"2.0","method":"x","params":{{"pad":"{}"}}}}"#, "a".repeat(64));
        let err = decode(&json, 32).unwrap_err();
        assert!(err.error.to_string().contains("exceeds"));
    }

    #[test]
    fn codec_round_trip_preserves_envelope() {
        let raw = r#"{"jsonrpc":"2.0","id":"r-1","method":"tools/call","params":{"name":"echo"}}"#;
        let decoded = decode(raw, MAX).unwrap();
        let encoded = encode(&decoded).unwrap();
        assert_eq!(decode(&encoded, MAX).unwrap(), decoded);
    }

    #[test]
    fn serialise_success_response() {
        let response = JsonRpcResponse::success(RequestId::Number(1), json!({"ok": true}));
        let json = encode(&Message::Response(response)).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":1"#));
        assert!(json.contains(r#""result":{"ok":true}"#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn serialise_error_response_with_null_id() {
        let response = JsonRpcResponse::failure(None, JsonRpcErrorData::from_code(ErrorCode::ParseError));
        let json = encode(&Message::Response(response)).unwrap();
        assert!(json.contains(r#""id":null"#));
        assert!(json.contains(r#""code":-32700"#));
        assert!(!json.contains("result"));
    }

    #[test]
    fn serialise_notification_has_no_id() {
        let notif = JsonRpcNotification::progress(json!("tok"), 1.0, Some(4.0), None);
        let json = encode(&Message::Notification(notif)).unwrap();
        assert!(!json.contains(r#""id""#));
        assert!(json.contains(r#""progressToken":"tok""#));
    }

    #[test]
    fn request_id_display() {
        assert_eq!(format!("{}", RequestId::Number(42)), "42");
        assert_eq!(format!("{}", RequestId::String("abc".to_string())), "abc");
    }
}
