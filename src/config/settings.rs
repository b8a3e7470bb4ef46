//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mcp::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Log levels accepted in `logging.level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol core settings shared by every connection.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Settings for serving local capabilities.
    #[serde(default)]
    pub server: ServerSettings,

    /// Settings for the multi-server manager.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// External MCP servers to connect to.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.protocol.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("protocol.request_timeout_ms must be greater than 0"));
        }
        if self.protocol.max_message_size == 0 {
            return Err(ConfigError::invalid("protocol.max_message_size must be greater than 0"));
        }

        if self.server.name.trim().is_empty() {
            return Err(ConfigError::invalid("server.name cannot be empty"));
        }
        if !self.server.http.path.starts_with('/') {
            return Err(ConfigError::invalid(format!(
                "server.http.path '{}' must start with '/'",
                self.server.http.path
            )));
        }

        self.manager.validate()?;

        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Protocol core configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// How long a request waits for its response.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Largest accepted serialised message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl ProtocolConfig {
    /// Returns the request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_timeout_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Which transport a connection uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON over standard streams.
    #[default]
    Stdio,
    /// POST per message plus an SSE stream.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Settings for serving local capabilities.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Name advertised in `serverInfo`.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Transport to serve on.
    #[serde(default)]
    pub transport: TransportKind,

    /// HTTP listener settings, used when `transport` is `http`.
    #[serde(default)]
    pub http: HttpSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            transport: TransportKind::default(),
            http: HttpSettings::default(),
        }
    }
}

fn default_server_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind. Zero picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint path for POST, GET and DELETE.
    #[serde(default = "default_path")]
    pub path: String,

    /// Whether to send permissive CORS headers.
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            cors: default_true(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    3001
}

fn default_path() -> String {
    "/mcp".to_string()
}

const fn default_true() -> bool {
    true
}

/// Multi-server manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Connect every enabled server on start.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Connection attempts allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,

    /// Interval between health-check pings.
    #[serde(default = "default_timeout_ms")]
    pub health_check_interval_ms: u64,

    /// First reconnection delay; doubled on every further attempt.
    #[serde(default = "default_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnection attempts before a server is reported failed.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Joins a server name and a colliding capability name.
    #[serde(default = "default_separator")]
    pub conflict_prefix_separator: String,

    /// How long the initialize handshake may take.
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between close and connect in a client reconnect.
    #[serde(default = "default_delay_ms")]
    pub retry_delay_ms: u64,
}

impl ManagerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::invalid(
                "manager.max_concurrent_connections must be at least 1",
            ));
        }
        let timeouts = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::invalid(format!(
                    "manager.{field} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_connect: default_true(),
            max_concurrent_connections: default_max_concurrent(),
            health_check_interval_ms: default_timeout_ms(),
            reconnect_base_delay_ms: default_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            conflict_prefix_separator: default_separator(),
            connect_timeout_ms: default_timeout_ms(),
            retry_delay_ms: default_delay_ms(),
        }
    }
}

const fn default_max_concurrent() -> usize {
    3
}

const fn default_delay_ms() -> u64 {
    1_000
}

const fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_separator() -> String {
    "_".to_string()
}

/// One external MCP server.
///
/// `name` is the identity key. A client built from a `ServerConfig` never
/// observes later edits to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique server name.
    pub name: String,

    /// Transport to reach the server over.
    #[serde(default)]
    pub transport: TransportKind,

    /// Executable to spawn (stdio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for `command`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for the spawned process.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Endpoint URL (http).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Whether the manager connects this server.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Creates an enabled stdio server entry.
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            enabled: true,
        }
    }

    /// Creates an enabled HTTP server entry.
    #[must_use]
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            enabled: true,
        }
    }

    /// Validates a single server entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the transport target is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("server name cannot be empty"));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::invalid(format!(
                        "stdio server '{}' requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Http => {
                let url = self.url.as_deref().unwrap_or_default();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::invalid(format!(
                        "http server '{}' requires an http:// or https:// url",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.servers.is_empty());
        assert_eq!(config.server.transport, TransportKind::Stdio);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "logging": { "level": "debug" },
            "protocol": { "request_timeout_ms": 5000, "max_message_size": 1024 },
            "server": {
                "name": "rag",
                "transport": "http",
                "http": { "host": "0.0.0.0", "port": 8080, "path": "/rpc", "cors": false }
            },
            "manager": {
                "auto_connect": false,
                "max_concurrent_connections": 1,
                "health_check_interval_ms": 10000,
                "reconnect_base_delay_ms": 250,
                "max_reconnect_attempts": 2,
                "conflict_prefix_separator": "__",
                "connect_timeout_ms": 2000,
                "retry_delay_ms": 100
            },
            "servers": [
                { "name": "files", "transport": "stdio", "command": "fs-mcp",
                  "args": ["--root", "/tmp"], "env": { "FS_TOKEN": "x" } },
                { "name": "remote", "transport": "http", "url": "http://localhost:3001/mcp",
                  "enabled": false }
            ]
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.protocol.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.http.port, 8080);
        assert!(!config.server.http.cors);
        assert_eq!(config.manager.max_concurrent_connections, 1);
        assert_eq!(config.manager.conflict_prefix_separator, "__");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].args, vec!["--root", "/tmp"]);
        assert!(config.servers[0].enabled);
        assert!(!config.servers[1].enabled);
    }

    #[test]
    fn logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn manager_config_defaults() {
        let config = ManagerConfig::default();
        assert!(config.auto_connect);
        assert_eq!(config.max_concurrent_connections, 3);
        assert_eq!(config.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.conflict_prefix_separator, "_");
    }

    #[test]
    fn reject_invalid_log_level() {
        let json = r#"{ "logging": { "level": "loud" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_zero_concurrency() {
        let json = r#"{ "manager": { "max_concurrent_connections": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_duplicate_server_names() {
        let json = r#"{ "servers": [
            { "name": "a", "command": "x" },
            { "name": "a", "command": "y" }
        ] }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn reject_incomplete_server_entries() {
        let stdio = ServerConfig {
            command: None,
            ..ServerConfig::stdio("a", "x", Vec::new())
        };
        assert!(stdio.validate().is_err());

        assert!(ServerConfig::http("b", "ftp://host").validate().is_err());
        assert!(ServerConfig::http("b", "https://host/mcp").validate().is_ok());
    }

    #[test]
    fn reject_relative_http_path() {
        let json = r#"{ "server": { "http": { "path": "mcp" } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
