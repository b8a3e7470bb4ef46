//! Per-method parameter validation.
//!
//! Validators return a [`ValidationFailure`] instead of panicking or
//! erroring deep inside a handler, so the caller can turn it into an
//! `InvalidParams` response and keep the connection open.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::mcp::capabilities::{ClientCapabilities, Implementation};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::methods;

/// A structured parameter validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// The offending field, if one can be named.
    pub field: Option<String>,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationFailure {
    fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    fn params(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{field}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<ValidationFailure> for McpError {
    fn from(failure: ValidationFailure) -> Self {
        Self::InvalidParams {
            message: failure.to_string(),
            field: failure.field,
        }
    }
}

/// MCP log severity, lowest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug detail.
    Debug,
    /// Informational.
    #[default]
    Info,
    /// Normal but significant.
    Notice,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical condition.
    Critical,
    /// Action must be taken immediately.
    Alert,
    /// System is unusable.
    Emergency,
}

impl LogLevel {
    /// Every level, in ascending severity.
    pub const ALL: [Self; 8] = [
        Self::Debug,
        Self::Info,
        Self::Notice,
        Self::Warning,
        Self::Error,
        Self::Critical,
        Self::Alert,
        Self::Emergency,
    ];

    /// The wire name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == name)
    }
}

/// An explicit `null` where the validators allow one reads as the default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parameters of `initialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by the client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default, deserialize_with = "null_as_default")]
    pub capabilities: ClientCapabilities,
    /// Client name and version.
    #[serde(default)]
    pub client_info: Option<Implementation>,
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default, deserialize_with = "null_as_default")]
    pub arguments: Map<String, Value>,
    /// Request metadata such as a progress token.
    #[serde(rename = "_meta", default)]
    pub meta: Option<RequestMeta>,
}

/// The `_meta` member of request params.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Token to tag `notifications/progress` with.
    #[serde(default)]
    pub progress_token: Option<Value>,
}

/// Parameters of `resources/read`, `resources/subscribe` and `resources/unsubscribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceParams {
    /// The resource URI.
    pub uri: String,
}

/// Parameters of `prompts/get`.
#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptParams {
    /// Name of the prompt.
    pub name: String,
    /// Prompt arguments.
    #[serde(default, deserialize_with = "null_as_default")]
    pub arguments: HashMap<String, String>,
}

/// Parameters of `logging/setLevel`.
#[derive(Debug, Clone, Deserialize)]
pub struct SetLevelParams {
    /// Minimum level to emit.
    pub level: LogLevel,
}

/// Validates request parameters for the methods that carry required fields.
///
/// Methods without a validator pass unchecked.
///
/// # Errors
///
/// Returns a [`ValidationFailure`] describing the first problem found.
pub fn validate_params(method: &str, params: Option<&Value>) -> Result<(), ValidationFailure> {
    match method {
        methods::INITIALIZE => validate_initialize(object(params)?),
        methods::TOOLS_CALL => validate_tools_call(object(params)?),
        methods::RESOURCES_READ | methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => {
            required_string(object(params)?, "uri").map(drop)
        }
        methods::PROMPTS_GET => validate_prompts_get(object(params)?),
        methods::LOGGING_SET_LEVEL => validate_set_level(object(params)?),
        _ => Ok(()),
    }
}

/// Validates and then deserialises request parameters.
///
/// # Errors
///
/// Returns `InvalidParams` if validation or deserialisation fails.
pub fn parse_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> McpResult<T> {
    validate_params(method, params.as_ref())?;
    let value = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value)
        .map_err(|e| McpError::invalid_params(format!("invalid {method} params: {e}")))
}

fn object(params: Option<&Value>) -> Result<&Map<String, Value>, ValidationFailure> {
    match params {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ValidationFailure::params("params must be an object")),
        None => Err(ValidationFailure::params("missing params")),
    }
}

fn required_string<'a>(params: &'a Map<String, Value>, field: &str) -> Result<&'a str, ValidationFailure> {
    match params.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ValidationFailure::field(field, "must not be empty")),
        Some(_) => Err(ValidationFailure::field(field, "must be a string")),
        None => Err(ValidationFailure::field(field, "is required")),
    }
}

fn optional_object(params: &Map<String, Value>, field: &str) -> Result<(), ValidationFailure> {
    match params.get(field) {
        None | Some(Value::Null | Value::Object(_)) => Ok(()),
        Some(_) => Err(ValidationFailure::field(field, "must be an object")),
    }
}

fn validate_initialize(params: &Map<String, Value>) -> Result<(), ValidationFailure> {
    required_string(params, "protocolVersion")?;
    optional_object(params, "capabilities")?;
    match params.get("clientInfo") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(info)) => required_string(info, "name")
            .map(drop)
            .map_err(|_| ValidationFailure::field("clientInfo.name", "is required")),
        Some(_) => Err(ValidationFailure::field("clientInfo", "must be an object")),
    }
}

fn validate_tools_call(params: &Map<String, Value>) -> Result<(), ValidationFailure> {
    required_string(params, "name")?;
    optional_object(params, "arguments")
}

fn validate_prompts_get(params: &Map<String, Value>) -> Result<(), ValidationFailure> {
    required_string(params, "name")?;
    match params.get("arguments") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(args)) => {
            for (key, value) in args {
                if !value.is_string() {
                    return Err(ValidationFailure::field(
                        &format!("arguments.{key}"),
                        "must be a string",
                    ));
                }
            }
            Ok(())
        }
        Some(_) => Err(ValidationFailure::field("arguments", "must be an object")),
    }
}

fn validate_set_level(params: &Map<String, Value>) -> Result<(), ValidationFailure> {
    let level = required_string(params, "level")?;
    if LogLevel::parse(level).is_none() {
        let known: Vec<_> = LogLevel::ALL.iter().map(|l| l.as_str()).collect();
        return Err(ValidationFailure::field(
            "level",
            format!("unknown level '{level}', expected one of: {}", known.join(", ")),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_requires_protocol_version() {
        let err = validate_params(methods::INITIALIZE, Some(&json!({}))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("protocolVersion"));

        let ok = json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": "c"}});
        assert!(validate_params(methods::INITIALIZE, Some(&ok)).is_ok());
    }

    #[test]
    fn initialize_client_info_needs_name() {
        let bad = json!({"protocolVersion": "2024-11-05", "clientInfo": {"version": "1"}});
        let err = validate_params(methods::INITIALIZE, Some(&bad)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("clientInfo.name"));
    }

    #[test]
    fn tools_call_arguments_must_be_object() {
        let bad = json!({"name": "echo", "arguments": [1, 2]});
        let err = validate_params(methods::TOOLS_CALL, Some(&bad)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("arguments"));

        assert!(validate_params(methods::TOOLS_CALL, Some(&json!({"name": "echo"}))).is_ok());
        assert!(validate_params(methods::TOOLS_CALL, None).is_err());
    }

    #[test]
    fn resources_read_requires_non_empty_uri() {
        let err = validate_params(methods::RESOURCES_READ, Some(&json!({"uri": " "}))).unwrap_err();
        assert_eq!(err.message, "must not be empty");
    }

    #[test]
    fn prompt_arguments_must_be_strings() {
        let bad = json!({"name": "rag_answer", "arguments": {"question": 3}});
        let err = validate_params(methods::PROMPTS_GET, Some(&bad)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("arguments.question"));
    }

    #[test]
    fn set_level_rejects_unknown_levels() {
        assert!(validate_params(methods::LOGGING_SET_LEVEL, Some(&json!({"level": "warning"}))).is_ok());
        let err = validate_params(methods::LOGGING_SET_LEVEL, Some(&json!({"level": "warn"}))).unwrap_err();
        assert!(err.message.contains("unknown level"));
    }

    #[test]
    fn failure_converts_to_invalid_params() {
        let error: McpError = ValidationFailure::field("name", "is required").into();
        assert!(matches!(
            error,
            McpError::InvalidParams { field: Some(ref f), .. } if f == "name"
        ));
    }

    #[test]
    fn parse_params_deserialises_after_validation() {
        let params: CallToolParams = parse_params(
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"text": "hi"}, "_meta": {"progressToken": 7}})),
        )
        .unwrap();
        assert_eq!(params.name, "echo");
        assert_eq!(params.arguments["text"], "hi");
        assert_eq!(params.meta.unwrap().progress_token, Some(json!(7)));
    }

    #[test]
    fn null_arguments_read_as_empty() {
        let call: CallToolParams =
            parse_params(methods::TOOLS_CALL, Some(json!({"name": "rag_status", "arguments": null}))).unwrap();
        assert!(call.arguments.is_empty());

        let prompt: GetPromptParams =
            parse_params(methods::PROMPTS_GET, Some(json!({"name": "rag_answer", "arguments": null}))).unwrap();
        assert!(prompt.arguments.is_empty());

        let init: InitializeParams = parse_params(
            methods::INITIALIZE,
            Some(json!({"protocolVersion": "2024-11-05", "capabilities": null})),
        )
        .unwrap();
        assert!(init.client_info.is_none());
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Warning);
        assert!(LogLevel::Emergency > LogLevel::Critical);
        assert_eq!(LogLevel::parse("notice"), Some(LogLevel::Notice));
    }

    #[test]
    fn unvalidated_methods_pass() {
        assert!(validate_params(methods::TOOLS_LIST, None).is_ok());
    }
}
