//! MCP server exposing the retrieval backend.
//!
//! This module implements the server lifecycle:
//!
//! 1. **Initialisation**: Capability negotiation and version agreement
//! 2. **Operation**: Listing and executing tools, resources and prompts
//! 3. **Shutdown**: Graceful connection termination on signal or peer close
//!
//! # Architecture
//!
//! The server owns the capability table and decides what is advertised. Every
//! listed tool either has an internal handler (`echo`) or is delegated to the
//! [`Backend`]. Execution failures come back in-band with `isError: true`;
//! only unknown identifiers are reported as protocol errors.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::mcp::backend::{Backend, BackendError, Progress};
use crate::mcp::capabilities::{
    CallToolResult, CapabilityRegistry, CatalogKind, GetPromptResult, Implementation,
    InitializeResult, Prompt, PromptArgument, ReadResourceResult, Resource, ResourceContents, Tool,
};
use crate::mcp::core::{
    Context, CoreOptions, HandlerMap, HandshakeState, PeerInfo, ProtocolCore, Side, DEFAULT_REQUEST_TIMEOUT,
};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{methods, DEFAULT_MAX_MESSAGE_SIZE, MCP_PROTOCOL_VERSION};
use crate::mcp::transport::Transport;
use crate::mcp::validation::{
    parse_params, CallToolParams, GetPromptParams, InitializeParams, LogLevel, ResourceParams,
    SetLevelParams,
};

/// Synchronous tool implemented by the server itself.
pub type InternalTool = Arc<dyn Fn(&Map<String, Value>) -> CallToolResult + Send + Sync>;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Name reported in `serverInfo`.
    pub name: String,
    /// Version reported in `serverInfo`.
    pub version: String,
    /// Timeout for requests the server sends.
    pub request_timeout: Duration,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
    /// Usage hint returned from `initialize`.
    pub instructions: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            instructions: Some(
                "Index documents with rag_index, then ask questions with rag_query.".to_string(),
            ),
        }
    }
}

impl ServerOptions {
    /// Options taken from the `server` and `protocol` config sections.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.server.name.clone(),
            request_timeout: config.protocol.request_timeout(),
            max_message_size: config.protocol.max_message_size,
            ..Self::default()
        }
    }
}

struct ServerShared {
    options: ServerOptions,
    backend: Arc<dyn Backend>,
    registry: RwLock<CapabilityRegistry>,
    internal: RwLock<HashMap<String, InternalTool>>,
    subscriptions: Mutex<HashSet<String>>,
    log_level: Mutex<LogLevel>,
    core: Mutex<Option<Arc<ProtocolCore>>>,
}

impl ServerShared {
    fn active_core(&self) -> Option<Arc<ProtocolCore>> {
        self.core.lock().ok().and_then(|core| core.clone())
    }

    fn registry(&self) -> McpResult<std::sync::RwLockReadGuard<'_, CapabilityRegistry>> {
        self.registry
            .read()
            .map_err(|_| McpError::internal("capability registry poisoned"))
    }
}

/// The MCP server for the retrieval backend.
#[derive(Clone)]
pub struct McpServer {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.shared.options.name)
            .field("serving", &self.shared.active_core().is_some())
            .finish_non_exhaustive()
    }
}

impl McpServer {
    /// Creates a server advertising the built-in capability table.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, options: ServerOptions) -> Self {
        let mut internal: HashMap<String, InternalTool> = HashMap::new();
        internal.insert("echo".to_string(), Arc::new(echo));

        Self {
            shared: Arc::new(ServerShared {
                options,
                backend,
                registry: RwLock::new(builtin_registry()),
                internal: RwLock::new(internal),
                subscriptions: Mutex::new(HashSet::new()),
                log_level: Mutex::new(LogLevel::Info),
                core: Mutex::new(None),
            }),
        }
    }

    /// The server's settings.
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    /// Currently advertised tools.
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.shared.registry().map(|r| r.tools()).unwrap_or_default()
    }

    /// Currently advertised resources.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.shared.registry().map(|r| r.resources()).unwrap_or_default()
    }

    /// Currently advertised prompts.
    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.shared.registry().map(|r| r.prompts()).unwrap_or_default()
    }

    /// Whether a session is currently being served.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.shared.active_core().is_some()
    }

    /// Advertises a tool delegated to the backend.
    pub async fn register_tool(&self, tool: Tool) {
        self.mutate(CatalogKind::Tools, |registry| {
            registry.register_tool(tool);
        })
        .await;
    }

    /// Advertises a tool the server runs itself.
    pub async fn register_internal_tool(&self, tool: Tool, handler: InternalTool) {
        if let Ok(mut internal) = self.shared.internal.write() {
            internal.insert(tool.name.clone(), handler);
        }
        self.register_tool(tool).await;
    }

    /// Stops advertising a tool. Returns whether it existed.
    pub async fn remove_tool(&self, name: &str) -> bool {
        let mut removed = false;
        self.mutate(CatalogKind::Tools, |registry| {
            removed = registry.remove_tool(name).is_some();
        })
        .await;
        if let Ok(mut internal) = self.shared.internal.write() {
            internal.remove(name);
        }
        removed
    }

    /// Advertises a resource.
    pub async fn register_resource(&self, resource: Resource) {
        self.mutate(CatalogKind::Resources, |registry| {
            registry.register_resource(resource);
        })
        .await;
    }

    /// Advertises a prompt.
    pub async fn register_prompt(&self, prompt: Prompt) {
        self.mutate(CatalogKind::Prompts, |registry| {
            registry.register_prompt(prompt);
        })
        .await;
    }

    async fn mutate(&self, kind: CatalogKind, change: impl FnOnce(&mut CapabilityRegistry)) {
        match self.shared.registry.write() {
            Ok(mut registry) => change(&mut registry),
            Err(_) => {
                tracing::error!("Capability registry poisoned");
                return;
            }
        }
        self.notify_ready(kind.list_changed_method(), None).await;
    }

    /// Sends a notification if a session has completed its handshake.
    async fn notify_ready(&self, method: &str, params: Option<Value>) -> bool {
        let Some(core) = self.shared.active_core() else {
            return false;
        };
        if core.session().state() != HandshakeState::Ready {
            return false;
        }
        match core.send_notification(method, params).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(method, error = %e, "Failed to notify client");
                false
            }
        }
    }

    /// Tells a subscribed client that a resource changed.
    ///
    /// Returns `false` if nobody is subscribed to `uri`.
    pub async fn notify_resource_updated(&self, uri: &str) -> bool {
        let subscribed = self
            .shared
            .subscriptions
            .lock()
            .is_ok_and(|subs| subs.contains(uri));
        if !subscribed {
            return false;
        }
        self.notify_ready(methods::RESOURCE_UPDATED, Some(json!({ "uri": uri })))
            .await
    }

    /// Sends a log message to the client if `level` passes its threshold.
    pub async fn log_to_client(&self, level: LogLevel, logger: &str, data: Value) -> bool {
        let threshold = self
            .shared
            .log_level
            .lock()
            .map_or(LogLevel::Info, |level| *level);
        if level < threshold {
            return false;
        }
        self.notify_ready(
            methods::MESSAGE,
            Some(json!({ "level": level, "logger": logger, "data": data })),
        )
        .await
    }

    /// The request handler table for one session.
    #[must_use]
    pub fn handlers(&self) -> HandlerMap {
        let mut map = HandlerMap::new();
        let weak = Arc::downgrade(&self.shared);

        route(&mut map, &weak, methods::INITIALIZE, handle_initialize);
        route(&mut map, &weak, methods::TOOLS_LIST, |shared, _, _| async move {
            Ok(json!({ "tools": shared.registry()?.tools() }))
        });
        route(&mut map, &weak, methods::TOOLS_CALL, handle_tools_call);
        route(&mut map, &weak, methods::RESOURCES_LIST, |shared, _, _| async move {
            Ok(json!({ "resources": shared.registry()?.resources() }))
        });
        route(&mut map, &weak, methods::RESOURCES_READ, handle_resources_read);
        route(&mut map, &weak, methods::RESOURCES_SUBSCRIBE, |shared, _, params| async move {
            let uri = known_resource(&shared, params, methods::RESOURCES_SUBSCRIBE)?;
            if let Ok(mut subs) = shared.subscriptions.lock() {
                subs.insert(uri);
            }
            Ok(json!({}))
        });
        route(&mut map, &weak, methods::RESOURCES_UNSUBSCRIBE, |shared, _, params| async move {
            let uri = known_resource(&shared, params, methods::RESOURCES_UNSUBSCRIBE)?;
            if let Ok(mut subs) = shared.subscriptions.lock() {
                subs.remove(&uri);
            }
            Ok(json!({}))
        });
        route(&mut map, &weak, methods::PROMPTS_LIST, |shared, _, _| async move {
            Ok(json!({ "prompts": shared.registry()?.prompts() }))
        });
        route(&mut map, &weak, methods::PROMPTS_GET, handle_prompts_get);
        route(&mut map, &weak, methods::LOGGING_SET_LEVEL, |shared, _, params| async move {
            let params: SetLevelParams = parse_params(methods::LOGGING_SET_LEVEL, params)?;
            if let Ok(mut level) = shared.log_level.lock() {
                *level = params.level;
            }
            tracing::debug!(level = params.level.as_str(), "Client log level set");
            Ok(json!({}))
        });

        map
    }

    /// Serves one session over `transport` until the peer goes away.
    ///
    /// Returns why the session ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot connect.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> McpResult<String> {
        self.serve_until(transport, std::future::pending()).await
    }

    /// Serves one session until the peer goes away or `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot connect.
    pub async fn serve_until(
        &self,
        transport: Arc<dyn Transport>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> McpResult<String> {
        let events = transport.connect().await?;

        let mut options = CoreOptions::new(self.shared.options.name.clone(), Side::Server);
        options.request_timeout = self.shared.options.request_timeout;
        options.max_message_size = self.shared.options.max_message_size;
        let core = ProtocolCore::new(Arc::clone(&transport), self.handlers(), options);

        if let Ok(mut subs) = self.shared.subscriptions.lock() {
            subs.clear();
        }
        if let Ok(mut slot) = self.shared.core.lock() {
            *slot = Some(Arc::clone(&core));
        }
        tracing::info!(
            server = %self.shared.options.name,
            transport = transport.kind(),
            "MCP server listening"
        );

        let reason = tokio::select! {
            reason = Arc::clone(&core).run(events) => reason,
            () = shutdown => {
                core.close();
                "shutdown requested".to_string()
            }
        };

        if let Ok(mut slot) = self.shared.core.lock() {
            slot.take();
        }
        transport.close().await;
        tracing::info!(server = %self.shared.options.name, reason = %reason, "MCP server stopped");
        Ok(reason)
    }

    /// Serves one session with graceful shutdown on SIGINT/SIGTERM (Ctrl+C on Windows).
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot connect.
    pub async fn run(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        self.serve_until(transport, shutdown_signal()).await.map(drop)
    }
}

/// Completes on the first termination signal.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) else {
        tracing::warn!("Failed to install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Completes on the first termination signal.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    } else {
        tracing::warn!("Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

/// Registers a handler that receives the live server state.
fn route<F, Fut>(map: &mut HandlerMap, weak: &Weak<ServerShared>, method: &str, handler: F)
where
    F: Fn(Arc<ServerShared>, Context, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    let weak = weak.clone();
    let handler = Arc::new(handler);
    map.on_request(method, move |ctx, params| {
        let shared = weak.upgrade();
        let handler = Arc::clone(&handler);
        async move {
            let shared = shared.ok_or_else(|| McpError::internal("server shut down"))?;
            handler(shared, ctx, params).await
        }
    });
}

fn to_value(value: &impl Serialize) -> McpResult<Value> {
    serde_json::to_value(value).map_err(|e| McpError::internal(format!("failed to serialise result: {e}")))
}

async fn handle_initialize(shared: Arc<ServerShared>, ctx: Context, params: Option<Value>) -> McpResult<Value> {
    let params: InitializeParams = parse_params(methods::INITIALIZE, params)?;
    if params.protocol_version != MCP_PROTOCOL_VERSION {
        tracing::warn!(requested = %params.protocol_version, "Rejecting unsupported protocol version");
        return Err(McpError::VersionCompatibility {
            requested: params.protocol_version,
            supported: MCP_PROTOCOL_VERSION.to_string(),
        });
    }

    let client = params
        .client_info
        .as_ref()
        .map_or("unknown", |info| info.name.as_str());
    tracing::info!(client, "Client initialising");
    ctx.session.set_peer(PeerInfo {
        protocol_version: params.protocol_version.clone(),
        implementation: params.client_info.clone(),
        capabilities: to_value(&params.capabilities)?,
    });

    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: shared.registry()?.server_capabilities(),
        server_info: Implementation::new(shared.options.name.clone(), shared.options.version.clone()),
        instructions: shared.options.instructions.clone(),
    };
    to_value(&result)
}

async fn handle_tools_call(shared: Arc<ServerShared>, ctx: Context, params: Option<Value>) -> McpResult<Value> {
    let params: CallToolParams = parse_params(methods::TOOLS_CALL, params)?;
    if shared.registry()?.tool(&params.name).is_none() {
        return Err(McpError::ToolNotFound { name: params.name });
    }

    let internal = shared
        .internal
        .read()
        .ok()
        .and_then(|internal| internal.get(&params.name).cloned());
    let result = if let Some(handler) = internal {
        handler(&params.arguments)
    } else {
        let progress = params
            .meta
            .and_then(|meta| meta.progress_token)
            .map_or_else(Progress::none, |token| Progress::new(ctx.peer.clone(), token));
        match shared.backend.call(&params.name, params.arguments, progress).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "Tool execution failed");
                CallToolResult::error(execution_failure(&e))
            }
        }
    };
    to_value(&result)
}

async fn handle_resources_read(shared: Arc<ServerShared>, _ctx: Context, params: Option<Value>) -> McpResult<Value> {
    let uri = known_resource(&shared, params, methods::RESOURCES_READ)?;
    let result = match shared.backend.read(&uri).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(uri = %uri, error = %e, "Resource read failed");
            ReadResourceResult {
                contents: vec![ResourceContents::text(uri, "text/plain", execution_failure(&e))],
                is_error: true,
            }
        }
    };
    to_value(&result)
}

async fn handle_prompts_get(shared: Arc<ServerShared>, _ctx: Context, params: Option<Value>) -> McpResult<Value> {
    let params: GetPromptParams = parse_params(methods::PROMPTS_GET, params)?;
    let missing: Vec<String> = {
        let registry = shared.registry()?;
        let prompt = registry
            .prompt(&params.name)
            .ok_or_else(|| McpError::PromptNotFound { name: params.name.clone() })?;
        prompt
            .required_arguments()
            .filter(|arg| !params.arguments.contains_key(*arg))
            .map(str::to_string)
            .collect()
    };
    if let Some(first) = missing.first() {
        return Err(McpError::InvalidParams {
            message: format!("missing required argument '{first}'"),
            field: Some(format!("arguments.{first}")),
        });
    }

    let result = match shared.backend.get(&params.name, &params.arguments).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(prompt = %params.name, error = %e, "Prompt rendering failed");
            GetPromptResult {
                description: Some(execution_failure(&e)),
                messages: Vec::new(),
                is_error: true,
            }
        }
    };
    to_value(&result)
}

fn known_resource(shared: &ServerShared, params: Option<Value>, method: &str) -> McpResult<String> {
    let params: ResourceParams = parse_params(method, params)?;
    if shared.registry()?.resource(&params.uri).is_none() {
        return Err(McpError::ResourceNotFound { uri: params.uri });
    }
    Ok(params.uri)
}

fn execution_failure(error: &BackendError) -> String {
    match error {
        BackendError::InvalidArguments(message) => format!("Invalid arguments: {message}"),
        other => format!("Execution failed: {other}"),
    }
}

fn echo(arguments: &Map<String, Value>) -> CallToolResult {
    match arguments.get("text").and_then(Value::as_str) {
        Some(text) => CallToolResult::text(text),
        None => CallToolResult::error("Invalid arguments: text is required"),
    }
}

/// Tools, resources and prompts every server starts with.
#[must_use]
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    registry.register_tool(Tool::new(
        "rag_query",
        "Query the RAG system: find indexed documents relevant to a question.",
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to answer" },
                "top_k": { "type": "integer", "minimum": 1, "description": "Maximum documents to return (default 3)" }
            },
            "required": ["question"]
        }),
    ));
    registry.register_tool(Tool::new(
        "rag_index",
        "Index new documents from local files.",
        json!({
            "type": "object",
            "properties": {
                "paths": { "type": "array", "items": { "type": "string" }, "description": "Files to index" }
            },
            "required": ["paths"]
        }),
    ));
    registry.register_tool(Tool::new(
        "rag_status",
        "Report index size and uptime.",
        json!({ "type": "object", "properties": {} }),
    ));
    registry.register_tool(Tool::new(
        "echo",
        "Return the given text unchanged.",
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }),
    ));

    registry.register_resource(Resource::json("rag://documents", "documents", "Indexed documents"));
    registry.register_resource(Resource::json(
        "rag://conversations",
        "conversations",
        "Questions answered so far",
    ));
    registry.register_resource(Resource::json("rag://system/stats", "stats", "Index statistics"));

    registry.register_prompt(Prompt {
        name: "rag_answer".to_string(),
        description: Some("Answer a question from retrieved context".to_string()),
        arguments: vec![
            PromptArgument::new("question", "The question to answer", true),
            PromptArgument::new("context", "Context to use instead of retrieval", false),
        ],
    });
    registry.register_prompt(Prompt {
        name: "summarize_document".to_string(),
        description: Some("Summarise one indexed document".to_string()),
        arguments: vec![PromptArgument::new(
            "uri",
            "Document ID, rag://documents/<id> URI or source path",
            true,
        )],
    });

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::backend::MemoryBackend;
    use crate::mcp::protocol::{decode, ErrorCode, JsonRpcResponse, Message, ResponsePayload};
    use crate::mcp::transport::{EventReceiver, MemoryTransport, TransportEvent};

    struct Session {
        server: McpServer,
        remote: MemoryTransport,
        rx: EventReceiver,
    }

    async fn start() -> Session {
        let server = McpServer::new(Arc::new(MemoryBackend::demo()), ServerOptions::default());
        let (local, remote) = MemoryTransport::pair();
        let rx = remote.connect().await.unwrap();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(Arc::new(local)).await });
        Session { server, remote, rx }
    }

    impl Session {
        async fn send(&self, message: Value) {
            self.remote.send(message.to_string()).await.unwrap();
        }

        async fn next(&mut self) -> Message {
            loop {
                match self.rx.recv().await {
                    Some(TransportEvent::Message(raw)) => return decode(&raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap(),
                    Some(_) => continue,
                    None => panic!("server went away"),
                }
            }
        }

        async fn request(&mut self, id: i64, method: &str, params: Value) -> JsonRpcResponse {
            self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
                .await;
            loop {
                if let Message::Response(response) = self.next().await {
                    return response;
                }
            }
        }

        async fn ready(&mut self) {
            let response = self
                .request(
                    1,
                    "initialize",
                    json!({"protocolVersion": MCP_PROTOCOL_VERSION, "clientInfo": {"name": "test", "version": "0"}}),
                )
                .await;
            assert!(response.into_result().is_ok());
            self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .await;
        }
    }

    fn error_code(response: JsonRpcResponse) -> i32 {
        match response.payload {
            ResponsePayload::Error(error) => error.code,
            ResponsePayload::Result(result) => panic!("expected error, got {result}"),
        }
    }

    #[tokio::test]
    async fn initialize_reports_capabilities_and_server_info() {
        let mut s = start().await;
        let result = s
            .request(1, "initialize", json!({"protocolVersion": MCP_PROTOCOL_VERSION}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
        assert!(result["capabilities"]["prompts"].is_object());
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let mut s = start().await;
        let response = s
            .request(1, "initialize", json!({"protocolVersion": "1999-01-01"}))
            .await;
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, McpError::VersionCompatibility { .. }));

        // A failed handshake may be retried.
        let response = s
            .request(2, "initialize", json!({"protocolVersion": MCP_PROTOCOL_VERSION}))
            .await;
        assert!(response.into_result().is_ok());
    }

    #[tokio::test]
    async fn requests_before_handshake_are_refused() {
        let mut s = start().await;
        let response = s.request(1, "tools/list", json!({})).await;
        assert_eq!(error_code(response), ErrorCode::InvalidRequest.code());

        let response = s.request(2, "ping", json!({})).await;
        assert_eq!(response.into_result().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn lists_builtin_catalog() {
        let mut s = start().await;
        s.ready().await;

        let tools = s.request(2, "tools/list", json!({})).await.into_result().unwrap();
        let names: Vec<_> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["rag_query", "rag_index", "rag_status", "echo"]);
        assert!(tools["tools"][0]["inputSchema"].is_object());

        let resources = s.request(3, "resources/list", json!({})).await.into_result().unwrap();
        assert_eq!(resources["resources"].as_array().unwrap().len(), 3);
        let prompts = s.request(4, "prompts/list", json!({})).await.into_result().unwrap();
        assert_eq!(prompts["prompts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn echo_and_delegated_tools() {
        let mut s = start().await;
        s.ready().await;

        let result = s
            .request(2, "tools/call", json!({"name": "echo", "arguments": {"text": "hi"}}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
        assert_eq!(result["isError"], false);

        let result = s
            .request(3, "tools/call", json!({"name": "rag_query", "arguments": {"question": "transports stdio"}}))
            .await
            .into_result()
            .unwrap();
        assert!(result["content"][0]["text"].as_str().unwrap().contains("builtin:transports"));
    }

    #[tokio::test]
    async fn execution_failures_are_in_band() {
        let mut s = start().await;
        s.ready().await;

        let result = s
            .request(2, "tools/call", json!({"name": "rag_index", "arguments": {"paths": []}}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"].as_str().unwrap().contains("Invalid arguments"));

        // The connection keeps working.
        let response = s.request(3, "ping", json!({})).await;
        assert!(response.into_result().is_ok());
    }

    #[tokio::test]
    async fn unknown_identifiers_are_protocol_errors() {
        let mut s = start().await;
        s.ready().await;

        let err = s
            .request(2, "tools/call", json!({"name": "nope"}))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err, McpError::ToolNotFound { name: "nope".into() });

        let err = s
            .request(3, "resources/read", json!({"uri": "rag://nope"}))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err, McpError::ResourceNotFound { uri: "rag://nope".into() });

        let err = s
            .request(4, "prompts/get", json!({"name": "nope"}))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err, McpError::PromptNotFound { name: "nope".into() });
    }

    #[tokio::test]
    async fn prompt_requires_declared_arguments() {
        let mut s = start().await;
        s.ready().await;

        let response = s.request(2, "prompts/get", json!({"name": "rag_answer"})).await;
        assert_eq!(error_code(response), ErrorCode::InvalidParams.code());

        let result = s
            .request(3, "prompts/get", json!({"name": "rag_answer", "arguments": {"question": "what transports?"}}))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn resource_read_returns_json_contents() {
        let mut s = start().await;
        s.ready().await;

        let result = s
            .request(2, "resources/read", json!({"uri": "rag://system/stats"}))
            .await
            .into_result()
            .unwrap();
        let text = result["contents"][0]["text"].as_str().unwrap();
        let stats: Value = serde_json::from_str(text).unwrap();
        assert_eq!(stats["documents"], 2);
    }

    #[tokio::test]
    async fn subscriptions_gate_update_notifications() {
        let mut s = start().await;
        s.ready().await;
        let _ = s.request(2, "ping", json!({})).await;

        assert!(!s.server.notify_resource_updated("rag://documents").await);
        let response = s.request(3, "resources/subscribe", json!({"uri": "rag://documents"})).await;
        assert!(response.into_result().is_ok());
        assert!(s.server.notify_resource_updated("rag://documents").await);

        let Message::Notification(notification) = s.next().await else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, methods::RESOURCE_UPDATED);
        assert_eq!(notification.params.unwrap()["uri"], "rag://documents");
    }

    #[tokio::test]
    async fn log_level_filters_client_messages() {
        let mut s = start().await;
        s.ready().await;
        let response = s.request(2, "logging/setLevel", json!({"level": "error"})).await;
        assert!(response.into_result().is_ok());

        assert!(!s.server.log_to_client(LogLevel::Info, "test", json!("quiet")).await);
        assert!(s.server.log_to_client(LogLevel::Critical, "test", json!("loud")).await);

        let Message::Notification(notification) = s.next().await else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, methods::MESSAGE);
        assert_eq!(notification.params.unwrap()["level"], "critical");
    }

    #[tokio::test]
    async fn registering_while_serving_announces_list_change() {
        let mut s = start().await;
        s.ready().await;
        let _ = s.request(2, "ping", json!({})).await;

        s.server
            .register_tool(Tool::new("extra", "Extra tool", json!({"type": "object"})))
            .await;
        let Message::Notification(notification) = s.next().await else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, "notifications/tools/list_changed");
        assert!(s.server.tools().iter().any(|t| t.name == "extra"));

        assert!(s.server.remove_tool("extra").await);
        assert!(!s.server.remove_tool("extra").await);
    }

    #[tokio::test]
    async fn serve_until_stops_on_shutdown() {
        let server = McpServer::new(Arc::new(MemoryBackend::new()), ServerOptions::default());
        let (local, remote) = MemoryTransport::pair();
        let mut rx = remote.connect().await.unwrap();

        let reason = server
            .serve_until(Arc::new(local), async {})
            .await
            .unwrap();
        assert_eq!(reason, "shutdown requested");
        assert!(!server.is_serving());
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
    }
}
