//! MCP client for one remote server.
//!
//! [`McpClient::connect`] runs the transport connect, the `initialize`
//! handshake and the catalog fetch. The fetched catalogs are cached locally
//! so calls to unknown names fail without a round trip, and they are cleared
//! the moment the connection drops.
//!
//! Lifecycle changes and server notifications are published as
//! [`ClientEvent`]s on a broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, ServerConfig, TransportKind};
use crate::mcp::capabilities::{
    CallToolResult, CapabilityRegistry, CatalogKind, ClientCapabilities, GetPromptResult,
    Implementation, InitializeResult, Prompt, ReadResourceResult, Resource, Tool,
};
use crate::mcp::core::{
    CoreOptions, HandlerMap, HandshakeState, PeerInfo, ProtocolCore, Side, DEFAULT_REQUEST_TIMEOUT,
};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{methods, DEFAULT_MAX_MESSAGE_SIZE, MCP_PROTOCOL_VERSION};
use crate::mcp::transport::{HttpClientTransport, ProcessSpec, StdioTransport, Transport};
use crate::mcp::validation::LogLevel;

const EVENT_CAPACITY: usize = 64;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name sent in `clientInfo`.
    pub name: String,
    /// Version sent in `clientInfo`.
    pub version: String,
    /// Timeout for ordinary requests.
    pub request_timeout: Duration,
    /// Timeout for the `initialize` request.
    pub connect_timeout: Duration,
    /// Pause between close and connect in [`McpClient::reconnect`].
    pub retry_delay: Duration,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_delay: Duration::from_secs(1),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientOptions {
    /// Options taken from the `protocol` and `manager` config sections.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.protocol.request_timeout(),
            connect_timeout: Duration::from_millis(config.manager.connect_timeout_ms),
            retry_delay: Duration::from_millis(config.manager.retry_delay_ms),
            max_message_size: config.protocol.max_message_size,
            ..Self::default()
        }
    }
}

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Connect or handshake in progress.
    Connecting,
    /// Handshake complete.
    Connected,
    /// The last connection attempt failed.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Something that happened on a client's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake complete and catalogs fetched.
    Connected,
    /// The connection dropped. Not emitted for [`McpClient::close`].
    Disconnected {
        /// What ended the connection.
        reason: String,
    },
    /// A catalog was refetched.
    CatalogChanged(CatalogKind),
    /// A subscribed resource changed on the server.
    ResourceUpdated {
        /// The resource URI.
        uri: String,
    },
    /// Progress for a call made with a progress token.
    Progress {
        /// The token the call carried.
        token: Value,
        /// Work done so far.
        progress: f64,
        /// Total work, if known.
        total: Option<f64>,
        /// Status text.
        message: Option<String>,
    },
    /// [`McpClient::reconnect`] failed.
    ReconnectFailed {
        /// Why the new connection failed.
        error: McpError,
    },
}

struct ClientShared {
    server: String,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    state: Mutex<ConnectionState>,
    catalog: RwLock<CapabilityRegistry>,
    server_info: Mutex<Option<InitializeResult>>,
    core: Mutex<Option<Arc<ProtocolCore>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map_or(ConnectionState::Failed, |state| *state)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn core(&self) -> McpResult<Arc<ProtocolCore>> {
        self.core
            .lock()
            .ok()
            .and_then(|core| core.clone())
            .ok_or_else(|| McpError::connection(format!("not connected to '{}'", self.server)))
    }

    fn clear_session(&self) {
        if let Ok(mut catalog) = self.catalog.write() {
            catalog.clear();
        }
        if let Ok(mut info) = self.server_info.lock() {
            info.take();
        }
        if let Ok(mut core) = self.core.lock() {
            if let Some(core) = core.take() {
                core.close();
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn catalog_contains(&self, check: impl FnOnce(&CapabilityRegistry) -> bool) -> bool {
        self.catalog.read().is_ok_and(|catalog| check(&catalog))
    }

    /// Runs when the protocol core's drive loop ends.
    async fn connection_lost(&self, generation: u64, reason: String) {
        if !self.is_current(generation) || self.state() != ConnectionState::Connected {
            return;
        }
        self.clear_session();
        self.set_state(ConnectionState::Disconnected);
        self.transport.close().await;
        tracing::info!(server = %self.server, reason = %reason, "MCP server disconnected");
        self.emit(ClientEvent::Disconnected { reason });
    }

    async fn refresh(&self, kind: CatalogKind) -> McpResult<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let core = self.core()?;
        let method = match kind {
            CatalogKind::Tools => methods::TOOLS_LIST,
            CatalogKind::Resources => methods::RESOURCES_LIST,
            CatalogKind::Prompts => methods::PROMPTS_LIST,
        };
        let result = core.send_request(method, None).await?;

        // A reply that lands after a disconnect must not repopulate the cache.
        if !self.is_current(generation) || core.is_closed() {
            return Err(McpError::connection("connection closed during refresh"));
        }
        let mut catalog = self
            .catalog
            .write()
            .map_err(|_| McpError::internal("catalog poisoned"))?;
        match kind {
            CatalogKind::Tools => catalog.replace_tools(list_field::<Tool>(result, "tools")?),
            CatalogKind::Resources => catalog.replace_resources(list_field::<Resource>(result, "resources")?),
            CatalogKind::Prompts => catalog.replace_prompts(list_field::<Prompt>(result, "prompts")?),
        }
        drop(catalog);
        tracing::debug!(server = %self.server, ?kind, "Catalog refreshed");
        self.emit(ClientEvent::CatalogChanged(kind));
        Ok(())
    }
}

fn list_field<T: DeserializeOwned>(mut result: Value, field: &str) -> McpResult<Vec<T>> {
    let items = result.get_mut(field).map(Value::take).unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(items).map_err(|e| McpError::Parse {
        message: format!("invalid {field} list: {e}"),
    })
}

fn from_result<T: DeserializeOwned>(method: &str, result: Value) -> McpResult<T> {
    serde_json::from_value(result).map_err(|e| McpError::Parse {
        message: format!("invalid {method} result: {e}"),
    })
}

/// A client connection to one MCP server.
#[derive(Clone)]
pub struct McpClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.shared.server)
            .field("transport", &self.shared.transport.kind())
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Creates a disconnected client for the server named `server`.
    #[must_use]
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(ClientShared {
                server: server.into(),
                transport,
                options,
                state: Mutex::new(ConnectionState::Disconnected),
                catalog: RwLock::new(CapabilityRegistry::new()),
                server_info: Mutex::new(None),
                core: Mutex::new(None),
                driver: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Creates a disconnected client with the transport `config` describes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if the config lacks the command or URL its
    /// transport needs.
    pub fn from_config(config: &ServerConfig, options: ClientOptions) -> McpResult<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Stdio => {
                let command = config
                    .command
                    .clone()
                    .ok_or_else(|| McpError::invalid_params(format!("server '{}' has no command", config.name)))?;
                let spec = ProcessSpec {
                    command,
                    args: config.args.clone(),
                    env: config.env.clone(),
                };
                Arc::new(StdioTransport::spawn(spec).with_max_message_size(options.max_message_size))
            }
            TransportKind::Http => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::invalid_params(format!("server '{}' has no url", config.name)))?;
                Arc::new(HttpClientTransport::new(url, options.request_timeout))
            }
        };
        Ok(Self::new(config.name.clone(), transport, options))
    }

    /// The configured server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.server
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether the handshake has completed and the connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// What the server reported from `initialize`.
    #[must_use]
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.shared.server_info.lock().ok().and_then(|info| info.clone())
    }

    /// Cached tools.
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.shared.catalog.read().map(|c| c.tools()).unwrap_or_default()
    }

    /// Cached resources.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.shared.catalog.read().map(|c| c.resources()).unwrap_or_default()
    }

    /// Cached prompts.
    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.shared.catalog.read().map(|c| c.prompts()).unwrap_or_default()
    }

    /// Subscribes to this client's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Whether `other` is a handle to the same client.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Connects, performs the handshake and fetches the advertised catalogs.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, a timeout if `initialize` is not
    /// answered within the connect timeout, or `VersionCompatibility` if the
    /// server speaks another protocol version.
    pub async fn connect(&self) -> McpResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ConnectionState::Connecting);
        tracing::info!(server = %self.shared.server, transport = self.shared.transport.kind(), "Connecting to MCP server");

        match self.establish(generation).await {
            Ok(()) if self.shared.is_current(generation) => {
                self.shared.set_state(ConnectionState::Connected);
                let tools = self.tools().len();
                tracing::info!(server = %self.shared.server, tools, "Connected to MCP server");
                self.shared.emit(ClientEvent::Connected);
                Ok(())
            }
            Ok(()) => Err(McpError::connection("connection superseded")),
            Err(e) => {
                // Retire this attempt so its drive loop stays quiet.
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
                self.teardown().await;
                self.shared.set_state(ConnectionState::Failed);
                tracing::warn!(server = %self.shared.server, error = %e, "MCP connection failed");
                Err(e)
            }
        }
    }

    async fn establish(&self, generation: u64) -> McpResult<()> {
        let shared = &self.shared;
        let events = shared.transport.connect().await?;

        let mut options = CoreOptions::new(shared.server.clone(), Side::Client);
        options.request_timeout = shared.options.request_timeout;
        options.max_message_size = shared.options.max_message_size;
        let core = ProtocolCore::new(Arc::clone(&shared.transport), self.handlers(), options);
        if let Ok(mut slot) = shared.core.lock() {
            *slot = Some(Arc::clone(&core));
        }

        let weak = Arc::downgrade(shared);
        let driver = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                let reason = core.run(events).await;
                if let Some(shared) = weak.upgrade() {
                    shared.connection_lost(generation, reason).await;
                }
            }
        });
        if let Ok(mut slot) = shared.driver.lock() {
            if let Some(previous) = slot.replace(driver) {
                previous.abort();
            }
        }

        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ClientCapabilities::default(),
            "clientInfo": Implementation::new(shared.options.name.clone(), shared.options.version.clone()),
        });
        let result = core
            .send_request_with_timeout(methods::INITIALIZE, Some(params), shared.options.connect_timeout)
            .await?;
        let init: InitializeResult = from_result(methods::INITIALIZE, result)?;
        if init.protocol_version != MCP_PROTOCOL_VERSION {
            return Err(McpError::VersionCompatibility {
                requested: MCP_PROTOCOL_VERSION.to_string(),
                supported: init.protocol_version,
            });
        }

        core.session().set_peer(PeerInfo {
            protocol_version: init.protocol_version.clone(),
            implementation: Some(init.server_info.clone()),
            capabilities: serde_json::to_value(&init.capabilities).unwrap_or(Value::Null),
        });
        core.session().set_state(HandshakeState::Negotiated);
        core.send_notification(methods::INITIALIZED, None).await?;
        core.session().set_state(HandshakeState::Ready);

        let capabilities = init.capabilities.clone();
        if let Ok(mut info) = shared.server_info.lock() {
            *info = Some(init);
        }

        for kind in [CatalogKind::Tools, CatalogKind::Resources, CatalogKind::Prompts] {
            if !capabilities.supports(kind) {
                continue;
            }
            if let Err(e) = shared.refresh(kind).await {
                if !shared.is_current(generation) || core.is_closed() {
                    return Err(e);
                }
                tracing::warn!(server = %shared.server, ?kind, error = %e, "Failed to fetch catalog");
            }
        }
        if core.is_closed() {
            return Err(McpError::connection("server closed the connection during the handshake"));
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.shared.clear_session();
        self.shared.transport.close().await;
        if let Ok(mut driver) = self.shared.driver.lock() {
            if let Some(driver) = driver.take() {
                driver.abort();
            }
        }
    }

    /// Closes the connection and, for stdio servers, stops the subprocess.
    ///
    /// Emits no [`ClientEvent::Disconnected`].
    pub async fn close(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let was = self.state();
        self.teardown().await;
        self.shared.set_state(ConnectionState::Disconnected);
        if was == ConnectionState::Connected {
            tracing::info!(server = %self.shared.server, "Closed MCP connection");
        }
    }

    /// Closes, waits the retry delay, and connects again.
    ///
    /// # Errors
    ///
    /// Returns the connect error, which is also published as
    /// [`ClientEvent::ReconnectFailed`].
    pub async fn reconnect(&self) -> McpResult<()> {
        self.close().await;
        tokio::time::sleep(self.shared.options.retry_delay).await;
        let result = self.connect().await;
        if let Err(e) = &result {
            self.shared.emit(ClientEvent::ReconnectFailed { error: e.clone() });
        }
        result
    }

    /// Refetches one catalog from the server.
    ///
    /// # Errors
    ///
    /// Returns the request's error.
    pub async fn refresh(&self, kind: CatalogKind) -> McpResult<()> {
        self.shared.refresh(kind).await
    }

    /// Calls a tool listed in the cached catalog.
    ///
    /// # Errors
    ///
    /// `ToolNotFound` if the tool is not cached, else the request's error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        self.call_tool_inner(name, arguments, None).await
    }

    /// Calls a tool with a progress token; progress arrives as
    /// [`ClientEvent::Progress`].
    ///
    /// # Errors
    ///
    /// `ToolNotFound` if the tool is not cached, else the request's error.
    pub async fn call_tool_with_progress(&self, name: &str, arguments: Value, token: Value) -> McpResult<CallToolResult> {
        self.call_tool_inner(name, arguments, Some(token)).await
    }

    async fn call_tool_inner(&self, name: &str, arguments: Value, token: Option<Value>) -> McpResult<CallToolResult> {
        if !self.shared.catalog_contains(|c| c.tool(name).is_some()) {
            return Err(McpError::ToolNotFound { name: name.to_string() });
        }
        let mut params = json!({ "name": name, "arguments": arguments });
        if let Some(token) = token {
            params["_meta"] = json!({ "progressToken": token });
        }
        let result = self
            .shared
            .core()?
            .send_request(methods::TOOLS_CALL, Some(params))
            .await?;
        from_result(methods::TOOLS_CALL, result)
    }

    /// Reads a resource listed in the cached catalog.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the resource is not cached, else the request's error.
    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.require_resource(uri)?;
        let result = self
            .shared
            .core()?
            .send_request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        from_result(methods::RESOURCES_READ, result)
    }

    /// Renders a prompt listed in the cached catalog.
    ///
    /// # Errors
    ///
    /// `PromptNotFound` if the prompt is not cached, else the request's error.
    pub async fn get_prompt(&self, name: &str, arguments: HashMap<String, String>) -> McpResult<GetPromptResult> {
        if !self.shared.catalog_contains(|c| c.prompt(name).is_some()) {
            return Err(McpError::PromptNotFound { name: name.to_string() });
        }
        let result = self
            .shared
            .core()?
            .send_request(methods::PROMPTS_GET, Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        from_result(methods::PROMPTS_GET, result)
    }

    /// Asks the server to announce changes to a resource.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the resource is not cached, else the request's error.
    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_resource(uri)?;
        self.shared
            .core()?
            .send_request(methods::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(drop)
    }

    /// Cancels a resource subscription.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the resource is not cached, else the request's error.
    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_resource(uri)?;
        self.shared
            .core()?
            .send_request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(drop)
    }

    /// Sets the minimum level of log messages the server sends.
    ///
    /// # Errors
    ///
    /// Returns the request's error.
    pub async fn set_log_level(&self, level: LogLevel) -> McpResult<()> {
        self.shared
            .core()?
            .send_request(methods::LOGGING_SET_LEVEL, Some(json!({ "level": level })))
            .await
            .map(drop)
    }

    /// Liveness check. Never fails; errors count as "not alive".
    pub async fn ping(&self) -> bool {
        let Ok(core) = self.shared.core() else {
            return false;
        };
        match core.send_request(methods::PING, None).await {
            Ok(_) => true,
            // Older servers lack `ping`; any answer to a cheap request will do.
            Err(McpError::MethodNotFound { .. }) => core.send_request(methods::TOOLS_LIST, None).await.is_ok(),
            Err(e) => {
                tracing::debug!(server = %self.shared.server, error = %e, "Ping failed");
                false
            }
        }
    }

    fn require_resource(&self, uri: &str) -> McpResult<()> {
        if self.shared.catalog_contains(|c| c.resource(uri).is_some()) {
            Ok(())
        } else {
            Err(McpError::ResourceNotFound { uri: uri.to_string() })
        }
    }

    fn handlers(&self) -> HandlerMap {
        let mut map = HandlerMap::new();

        for kind in [CatalogKind::Tools, CatalogKind::Resources, CatalogKind::Prompts] {
            let weak = Arc::downgrade(&self.shared);
            map.on_notification(kind.list_changed_method(), move |_, _| {
                spawn_refresh(&weak, kind);
            });
        }

        let weak = Arc::downgrade(&self.shared);
        map.on_notification(methods::RESOURCE_UPDATED, move |_, params| {
            let uri = params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str);
            if let (Some(shared), Some(uri)) = (weak.upgrade(), uri) {
                shared.emit(ClientEvent::ResourceUpdated { uri: uri.to_string() });
            }
        });

        let weak = Arc::downgrade(&self.shared);
        map.on_notification(methods::PROGRESS, move |_, params| {
            let (Some(shared), Some(params)) = (weak.upgrade(), params) else {
                return;
            };
            let Some(progress) = params.get("progress").and_then(Value::as_f64) else {
                return;
            };
            shared.emit(ClientEvent::Progress {
                token: params.get("progressToken").cloned().unwrap_or(Value::Null),
                progress,
                total: params.get("total").and_then(Value::as_f64),
                message: params.get("message").and_then(Value::as_str).map(str::to_string),
            });
        });

        let server = self.shared.server.clone();
        map.on_notification(methods::MESSAGE, move |_, params| {
            log_server_message(&server, params.as_ref());
        });

        map
    }
}

fn spawn_refresh(weak: &Weak<ClientShared>, kind: CatalogKind) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = shared.refresh(kind).await {
            tracing::warn!(server = %shared.server, ?kind, error = %e, "Failed to refresh catalog");
        }
    });
}

/// Re-emits a server's `notifications/message` as a tracing event.
fn log_server_message(server: &str, params: Option<&Value>) {
    let level = params
        .and_then(|p| p.get("level"))
        .and_then(Value::as_str)
        .and_then(LogLevel::parse)
        .unwrap_or_default();
    let logger = params
        .and_then(|p| p.get("logger"))
        .and_then(Value::as_str)
        .unwrap_or("-");
    let data = params
        .and_then(|p| p.get("data"))
        .map_or_else(String::new, |d| d.as_str().map_or_else(|| d.to_string(), str::to_string));

    match level {
        LogLevel::Debug => tracing::debug!(server, logger, "{data}"),
        LogLevel::Info | LogLevel::Notice => tracing::info!(server, logger, "{data}"),
        LogLevel::Warning => tracing::warn!(server, logger, "{data}"),
        _ => tracing::error!(server, logger, "{data}"),
    }
}
