//! Protocol error taxonomy.
//!
//! Every failure that can cross the protocol boundary is an [`McpError`].
//! Each variant maps to a JSON-RPC error code, can be rendered as an error
//! object for the wire, and can be reconstructed from one received from a
//! peer.
//!
//! # Security Note
//!
//! Error objects and log lines must never echo credentials. Structured data is
//! passed through [`redact_value`] and messages through [`redact_message`]
//! before they leave this process.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData};

/// Result type for protocol operations.
pub type McpResult<T> = Result<T, McpError>;

/// Field-name fragments whose values are never logged or echoed.
pub const SENSITIVE_KEYS: &[&str] = &["password", "token", "key", "secret", "auth", "credential"];

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Errors produced by the protocol stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum McpError {
    /// Invalid JSON was received.
    #[error("parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// The payload is not a valid JSON-RPC message.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of what is wrong.
        message: String,
    },

    /// No handler is registered for the method.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// The requested method.
        method: String,
    },

    /// Method parameters failed validation.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Description of the validation failure.
        message: String,
        /// The offending field, if known.
        field: Option<String>,
    },

    /// Unexpected failure while handling a request.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// No response arrived within the request timeout.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The method that timed out.
        method: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The logical connection is closed or was never established.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// The byte transport failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The named tool is not in the catalog.
    #[error("tool not found: {name}")]
    ToolNotFound {
        /// Tool name.
        name: String,
    },

    /// The resource URI is not in the catalog.
    #[error("resource not found: {uri}")]
    ResourceNotFound {
        /// Resource URI.
        uri: String,
    },

    /// The named prompt is not in the catalog.
    #[error("prompt not found: {name}")]
    PromptNotFound {
        /// Prompt name.
        name: String,
    },

    /// The request was cancelled before a response arrived.
    #[error("request cancelled: {reason}")]
    Cancelled {
        /// Why the request was cancelled.
        reason: String,
    },

    /// The peers do not share a protocol version.
    #[error("incompatible protocol version '{requested}' (supported: {supported})")]
    VersionCompatibility {
        /// Version offered by the peer.
        requested: String,
        /// Version this implementation speaks.
        supported: String,
    },

    /// An error object from the peer with a code outside the known taxonomy.
    #[error("peer error [{code}]: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i32,
        /// Peer-provided message.
        message: String,
        /// Peer-provided data.
        data: Option<Value>,
    },
}

impl McpError {
    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an invalid params error without a field reference.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            field: None,
        }
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a timeout error for a method.
    #[allow(clippy::cast_possible_truncation)] // timeouts never approach u64::MAX milliseconds
    pub fn timeout(method: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Returns the JSON-RPC error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Parse { .. } => ErrorCode::ParseError,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::Internal { .. } => ErrorCode::InternalError,
            Self::ToolNotFound { .. } | Self::ResourceNotFound { .. } | Self::PromptNotFound { .. } => {
                ErrorCode::NotFound
            }
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::Transport { .. }
            | Self::VersionCompatibility { .. } => ErrorCode::RequestFailed,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Remote { code, .. } => ErrorCode::ServerError(*code),
        }
    }

    /// Short kind label, carried in error data so peers can reconstruct the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal",
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::Transport { .. } => "transport",
            Self::ToolNotFound { .. } => "tool",
            Self::ResourceNotFound { .. } => "resource",
            Self::PromptNotFound { .. } => "prompt",
            Self::Cancelled { .. } => "cancelled",
            Self::VersionCompatibility { .. } => "version",
            Self::Remote { .. } => "remote",
        }
    }

    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Internal { .. } | Self::Timeout { .. } | Self::Connection { .. } | Self::Transport { .. }
        )
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Renders this error as a redacted JSON-RPC error object.
    #[must_use]
    pub fn to_error_object(&self) -> JsonRpcErrorData {
        let data = match self {
            Self::MethodNotFound { method } => Some(json!({ "kind": self.kind(), "method": method })),
            Self::InvalidParams {
                field: Some(field), ..
            } => Some(json!({ "kind": self.kind(), "field": field })),
            Self::Timeout { method, timeout_ms } => {
                Some(json!({ "kind": self.kind(), "method": method, "timeoutMs": timeout_ms }))
            }
            Self::Connection { .. } | Self::Transport { .. } => Some(json!({ "kind": self.kind() })),
            Self::ToolNotFound { name } | Self::PromptNotFound { name } => {
                Some(json!({ "kind": self.kind(), "name": name }))
            }
            Self::ResourceNotFound { uri } => Some(json!({ "kind": self.kind(), "uri": uri })),
            Self::VersionCompatibility {
                requested,
                supported,
            } => Some(json!({ "kind": self.kind(), "requested": requested, "supported": supported })),
            Self::Remote { data, .. } => data.clone(),
            _ => None,
        };

        let message = match self {
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let mut object = JsonRpcErrorData::with_message(self.code(), redact_message(&message));
        if let Some(data) = data {
            object = object.with_data(redact_value(&data));
        }
        object
    }

    /// Reconstructs an error from a JSON-RPC error object sent by a peer.
    #[must_use]
    pub fn from_error_object(object: &JsonRpcErrorData) -> Self {
        let data = object.data.as_ref();
        let kind = data.and_then(|d| d.get("kind")).and_then(Value::as_str);
        let field = |name: &str| {
            data.and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let message = object.message.clone();

        match (object.code, kind) {
            (-32700, _) => Self::Parse { message },
            (-32600, _) => Self::InvalidRequest { message },
            (-32601, _) => Self::MethodNotFound {
                method: field("method").unwrap_or(message),
            },
            (-32602, _) => Self::InvalidParams {
                message,
                field: field("field"),
            },
            (-32603, _) => Self::Internal { message },
            (-32001, Some("tool")) => Self::ToolNotFound {
                name: field("name").unwrap_or(message),
            },
            (-32001, Some("resource")) => Self::ResourceNotFound {
                uri: field("uri").unwrap_or(message),
            },
            (-32001, Some("prompt")) => Self::PromptNotFound {
                name: field("name").unwrap_or(message),
            },
            (-32002, Some("timeout")) => Self::Timeout {
                method: field("method").unwrap_or_default(),
                timeout_ms: data
                    .and_then(|d| d.get("timeoutMs"))
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
            },
            (-32002, Some("connection")) => Self::Connection { message },
            (-32002, Some("transport")) => Self::Transport { message },
            (-32002, Some("version")) => Self::VersionCompatibility {
                requested: field("requested").unwrap_or_default(),
                supported: field("supported").unwrap_or_default(),
            },
            (-32800, _) => Self::Cancelled { reason: message },
            (code, _) => Self::Remote {
                code,
                message,
                data: object.data.clone(),
            },
        }
    }
}

/// Whether a field name refers to credential material.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lower.contains(s))
}

/// Returns a copy of `value` with every sensitive object field replaced.
#[must_use]
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

fn sensitive_fragment() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Matches `api_key=abc`, `"token": "abc"`, `password: abc` and similar.
        Regex::new(
            r#"(?i)("?[a-z0-9_\-]*(?:password|token|key|secret|auth|credential)[a-z0-9_\-]*"?\s*[:=]\s*)("[^"]*"|[^\s,;}]+)"#,
        )
        .expect("credential pattern is a valid regex")
    })
}

/// Masks `key=value` style credential fragments in free text.
#[must_use]
pub fn redact_message(message: &str) -> String {
    sensitive_fragment()
        .replace_all(message, format!("${{1}}{REDACTED}"))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retryable_classification() {
        assert!(McpError::internal("x").is_retryable());
        assert!(McpError::timeout("tools/call", Duration::from_secs(1)).is_retryable());
        assert!(McpError::connection("closed").is_retryable());
        assert!(McpError::transport("reset").is_retryable());

        assert!(!McpError::invalid_params("bad").is_retryable());
        assert!(!McpError::ToolNotFound { name: "x".into() }.is_retryable());
        assert!(!McpError::Cancelled { reason: "user".into() }.is_retryable());
        assert!(!McpError::VersionCompatibility {
            requested: "1".into(),
            supported: "2".into()
        }
        .is_retryable());
    }

    #[test]
    fn error_codes() {
        assert_eq!(McpError::Parse { message: String::new() }.code().code(), -32700);
        assert_eq!(McpError::invalid_request("x").code().code(), -32600);
        assert_eq!(McpError::MethodNotFound { method: "m".into() }.code().code(), -32601);
        assert_eq!(McpError::invalid_params("x").code().code(), -32602);
        assert_eq!(McpError::internal("x").code().code(), -32603);
        assert_eq!(McpError::ResourceNotFound { uri: "u".into() }.code().code(), -32001);
        assert_eq!(McpError::connection("x").code().code(), -32002);
        assert_eq!(McpError::Cancelled { reason: "r".into() }.code().code(), -32800);
    }

    #[test]
    fn not_found_kinds_survive_the_wire() {
        let cases = [
            McpError::ToolNotFound { name: "echo".into() },
            McpError::ResourceNotFound {
                uri: "rag://documents".into(),
            },
            McpError::PromptNotFound { name: "p".into() },
            McpError::timeout("initialize", Duration::from_millis(250)),
            McpError::VersionCompatibility {
                requested: "1999-01-01".into(),
                supported: "2024-11-05".into(),
            },
        ];
        for error in cases {
            let decoded = McpError::from_error_object(&error.to_error_object());
            assert_eq!(decoded, error);
        }
    }

    #[test]
    fn unknown_codes_become_remote() {
        let object = JsonRpcErrorData::with_message(ErrorCode::ServerError(-31000), "boom");
        let error = McpError::from_error_object(&object);
        assert!(matches!(error, McpError::Remote { code: -31000, .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn redacts_nested_sensitive_fields() {
        let value = json!({
            "user": "alice",
            "Password": "hunter2",
            "nested": { "api_key": "k-123", "items": [{ "authToken": "t" }] }
        });
        let redacted = redact_value(&value);
        assert_eq!(redacted["user"], "alice");
        assert_eq!(redacted["Password"], REDACTED);
        assert_eq!(redacted["nested"]["api_key"], REDACTED);
        assert_eq!(redacted["nested"]["items"][0]["authToken"], REDACTED);
    }

    #[test]
    fn redacts_message_fragments() {
        let masked = redact_message("login failed for user=bob password=hunter2, retry");
        assert!(!masked.contains("hunter2"));
        assert!(masked.contains("user=bob"));

        let masked = redact_message(r#"bad header {"token": "abc.def"}"#);
        assert!(!masked.contains("abc.def"));
    }

    #[test]
    fn error_object_is_redacted() {
        let error = McpError::Remote {
            code: -31000,
            message: "secret=shh".into(),
            data: Some(json!({ "credential": "c" })),
        };
        let object = error.to_error_object();
        assert!(!object.message.contains("shh"));
        assert_eq!(object.data.unwrap()["credential"], REDACTED);
    }
}
