//! Connection manager for many MCP servers.
//!
//! The manager owns one [`McpClient`] per configured server and merges their
//! catalogs into one aggregate namespace. When two servers expose the same
//! name, the later one is re-keyed as `<server><separator><name>` so both stay
//! callable.
//!
//! # Lifecycle
//!
//! ```text
//! configured ─▶ connecting ─▶ connected ─▶ (transport closed) ─▶ disconnected
//!                   │  ▲                                              │
//!                   ▼  └────────── retry after base·2^n ◀─────────────┘
//!                 failed (retries exhausted)
//! ```
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! await, so a server's aggregate entries are added or purged in a single
//! step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{Config, ServerConfig};
use crate::mcp::capabilities::{
    CallToolResult, CatalogKind, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool,
};
use crate::mcp::client::{ClientEvent, ClientOptions, ConnectionState, McpClient};
use crate::mcp::error::{McpError, McpResult};

const EVENT_CAPACITY: usize = 128;

/// Reconnection backoff: `base_delay * 2^attempt`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (zero-based), or `None` once
    /// the budget is spent.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Connect every enabled server in [`ServerManager::start`].
    pub auto_connect: bool,
    /// Connection attempts allowed in flight at once.
    pub max_concurrent_connections: usize,
    /// Interval between health-check pings.
    pub health_check_interval: Duration,
    /// Reconnection backoff.
    pub retry: RetryPolicy,
    /// Joins a server name and a colliding capability name.
    pub separator: String,
    /// Settings for every client.
    pub client: ClientOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ManagerOptions {
    /// Options taken from the `manager` and `protocol` config sections.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let manager = &config.manager;
        Self {
            auto_connect: manager.auto_connect,
            max_concurrent_connections: manager.max_concurrent_connections.max(1),
            health_check_interval: Duration::from_millis(manager.health_check_interval_ms),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(manager.reconnect_base_delay_ms),
                max_attempts: manager.max_reconnect_attempts,
            },
            separator: manager.conflict_prefix_separator.clone(),
            client: ClientOptions::from_config(config),
        }
    }
}

/// Builds the client for a server config.
pub trait Connector: Send + Sync {
    /// Creates a disconnected client for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be turned into a transport.
    fn create(&self, config: &ServerConfig, options: &ClientOptions) -> McpResult<McpClient>;
}

/// Spawns stdio subprocesses and opens HTTP endpoints as configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

impl Connector for TransportConnector {
    fn create(&self, config: &ServerConfig, options: &ClientOptions) -> McpResult<McpClient> {
        McpClient::from_config(config, options.clone())
    }
}

/// Something that happened to a managed server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A connection attempt took a slot and started.
    ServerConnecting {
        /// Server name.
        server: String,
    },
    /// A server connected and its catalog was merged.
    ServerConnected {
        /// Server name.
        server: String,
        /// Tools it contributed.
        tools: usize,
    },
    /// A connected server went away or was removed.
    ServerDisconnected {
        /// Server name.
        server: String,
        /// Why.
        reason: String,
    },
    /// A connection attempt failed.
    ServerFailed {
        /// Server name.
        server: String,
        /// The error.
        error: String,
        /// Whether another attempt is scheduled.
        will_retry: bool,
    },
    /// A connected server did not answer a health-check ping.
    HealthCheckFailed {
        /// Server name.
        server: String,
    },
    /// A reconnection attempt is scheduled.
    ReconnectScheduled {
        /// Server name.
        server: String,
        /// Zero-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// A server's catalog changed and was re-merged.
    CapabilitiesChanged {
        /// Server name.
        server: String,
    },
}

/// One aggregate catalog entry and where it routes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routed<T> {
    /// Name in the aggregate namespace.
    pub name: String,
    /// Owning server.
    pub server: String,
    /// Name on the owning server.
    pub original_name: String,
    /// The server's descriptor.
    pub descriptor: T,
}

/// Snapshot of the aggregate namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedCapabilities {
    /// Every routed tool.
    pub tools: Vec<Routed<Tool>>,
    /// Every routed resource, keyed by URI.
    pub resources: Vec<Routed<Resource>>,
    /// Every routed prompt.
    pub prompts: Vec<Routed<Prompt>>,
}

/// Per-server connection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server name.
    pub name: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Reconnection attempts since the last success.
    pub retry_count: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Tools in the server's catalog.
    pub tools: usize,
    /// Resources in the server's catalog.
    pub resources: usize,
    /// Prompts in the server's catalog.
    pub prompts: usize,
}

#[derive(Debug, Default)]
struct Aggregate {
    tools: IndexMap<String, Routed<Tool>>,
    resources: IndexMap<String, Routed<Resource>>,
    prompts: IndexMap<String, Routed<Prompt>>,
}

impl Aggregate {
    /// Owning server and original name of an aggregate entry.
    fn target(&self, kind: CatalogKind, name: &str) -> Option<(String, String)> {
        let found = match kind {
            CatalogKind::Tools => self.tools.get(name).map(|e| (&e.server, &e.original_name)),
            CatalogKind::Resources => self.resources.get(name).map(|e| (&e.server, &e.original_name)),
            CatalogKind::Prompts => self.prompts.get(name).map(|e| (&e.server, &e.original_name)),
        };
        found.map(|(server, original)| (server.clone(), original.clone()))
    }

    fn purge(&mut self, server: &str) {
        self.tools.retain(|_, entry| entry.server != server);
        self.resources.retain(|_, entry| entry.server != server);
        self.prompts.retain(|_, entry| entry.server != server);
    }

    fn merge(&mut self, server: &str, separator: &str, client: &McpClient) {
        merge_into(&mut self.tools, server, separator, client.tools(), |t| t.name.clone());
        merge_into(&mut self.resources, server, separator, client.resources(), |r| r.uri.clone());
        merge_into(&mut self.prompts, server, separator, client.prompts(), |p| p.name.clone());
    }

    fn snapshot(&self) -> AggregatedCapabilities {
        AggregatedCapabilities {
            tools: self.tools.values().cloned().collect(),
            resources: self.resources.values().cloned().collect(),
            prompts: self.prompts.values().cloned().collect(),
        }
    }
}

fn merge_into<T>(
    map: &mut IndexMap<String, Routed<T>>,
    server: &str,
    separator: &str,
    items: Vec<T>,
    key: impl Fn(&T) -> String,
) {
    for item in items {
        let original = key(&item);
        let name = if map.contains_key(&original) {
            let prefixed = format!("{server}{separator}{original}");
            if map.contains_key(&prefixed) {
                tracing::warn!(server, name = %original, "Skipping capability: prefixed name also taken");
                continue;
            }
            tracing::debug!(server, name = %original, alias = %prefixed, "Capability name collision");
            prefixed
        } else {
            original.clone()
        };
        map.insert(
            name.clone(),
            Routed {
                name,
                server: server.to_string(),
                original_name: original,
                descriptor: item,
            },
        );
    }
}

struct Entry {
    config: ServerConfig,
    epoch: u64,
    state: ConnectionState,
    client: Option<McpClient>,
    retry_count: u32,
    last_error: Option<String>,
    watcher: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl Entry {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct State {
    running: bool,
    servers: IndexMap<String, Entry>,
    aggregate: Aggregate,
}

struct ManagerShared {
    options: ManagerOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    slots: Semaphore,
    epochs: AtomicU64,
    events: broadcast::Sender<ManagerEvent>,
    health: Mutex<Option<JoinHandle<()>>>,
}

/// Aggregates many MCP servers into one capability namespace.
#[derive(Clone)]
pub struct ServerManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("running", &self.is_running())
            .field("servers", &self.server_names())
            .finish_non_exhaustive()
    }
}

impl ServerManager {
    /// Creates a stopped manager over `servers` using real transports.
    #[must_use]
    pub fn new(servers: Vec<ServerConfig>, options: ManagerOptions) -> Self {
        Self::with_connector(servers, options, Arc::new(TransportConnector))
    }

    /// Creates a stopped manager that builds clients with `connector`.
    #[must_use]
    pub fn with_connector(servers: Vec<ServerConfig>, options: ManagerOptions, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ManagerShared {
            slots: Semaphore::new(options.max_concurrent_connections.max(1)),
            options,
            connector,
            state: Mutex::new(State::default()),
            epochs: AtomicU64::new(0),
            events,
            health: Mutex::new(None),
        });
        for config in servers {
            if let Err(e) = shared.insert(config) {
                tracing::warn!(error = %e, "Ignoring server config");
            }
        }
        Self { shared }
    }

    /// Subscribes to manager events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.shared.events.subscribe()
    }

    /// Whether [`start`](Self::start) has run without a matching [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_ok_and(|state| state.running)
    }

    /// Every configured server name.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .map(|state| state.servers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of servers with a live client.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .map(|state| {
                state
                    .servers
                    .iter()
                    .filter(|(_, entry)| entry.client.is_some())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The live client for `server`.
    #[must_use]
    pub fn client(&self, server: &str) -> Option<McpClient> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.servers.get(server).and_then(|entry| entry.client.clone()))
    }

    /// Connection state of `server`.
    #[must_use]
    pub fn server_state(&self, server: &str) -> Option<ConnectionState> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.servers.get(server).map(|entry| entry.state))
    }

    /// Starts health checks and, if configured, connects every enabled
    /// server. Returns how many servers are connected afterwards.
    pub async fn start(&self) -> usize {
        let targets: Option<Vec<(String, u64)>> = {
            let Ok(mut state) = self.shared.state.lock() else {
                return 0;
            };
            if state.running {
                None
            } else {
                state.running = true;
                let auto_connect = self.shared.options.auto_connect;
                Some(
                    state
                        .servers
                        .iter()
                        .filter(|(_, entry)| auto_connect && entry.config.enabled)
                        .map(|(name, entry)| (name.clone(), entry.epoch))
                        .collect(),
                )
            }
        };
        let Some(targets) = targets else {
            return self.clients().len();
        };
        self.shared.start_health_checks();
        tracing::info!(servers = targets.len(), "Starting MCP server manager");

        let attempts = targets.iter().map(|(name, epoch)| {
            let shared = Arc::clone(&self.shared);
            async move { shared.connect_entry(name, *epoch).await }
        });
        join_all(attempts).await;
        self.clients().len()
    }

    /// Stops health checks and retries and closes every client.
    pub async fn stop(&self) {
        if let Ok(mut health) = self.shared.health.lock() {
            if let Some(task) = health.take() {
                task.abort();
            }
        }
        let clients: Vec<McpClient> = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            state.running = false;
            state.aggregate = Aggregate::default();
            state
                .servers
                .values_mut()
                .filter_map(|entry| {
                    entry.abort_tasks();
                    entry.state = ConnectionState::Disconnected;
                    entry.client.take()
                })
                .collect()
        };
        join_all(clients.iter().map(McpClient::close)).await;
        tracing::info!(closed = clients.len(), "MCP server manager stopped");
    }

    /// Adds a server and, if enabled, connects it.
    ///
    /// While the manager is running a failed connect is also retried in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` for an invalid or duplicate config, or the
    /// connect error.
    pub async fn add_server(&self, config: ServerConfig) -> McpResult<()> {
        let name = config.name.clone();
        let enabled = config.enabled;
        let epoch = self.shared.insert(config)?;
        if !enabled {
            return Ok(());
        }
        self.shared.connect_entry(&name, epoch).await
    }

    /// Closes and forgets a server. Returns `false` if it was unknown.
    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = {
            let Ok(mut state) = self.shared.state.lock() else {
                return false;
            };
            let Some(mut entry) = state.servers.shift_remove(name) else {
                return false;
            };
            state.aggregate.purge(name);
            entry.abort_tasks();
            entry.client.take()
        };
        if let Some(client) = removed {
            client.close().await;
            self.shared.emit(ManagerEvent::ServerDisconnected {
                server: name.to_string(),
                reason: "removed".to_string(),
            });
        }
        tracing::info!(server = name, "Removed MCP server");
        true
    }

    /// Snapshot of the aggregate namespace.
    #[must_use]
    pub fn get_aggregated_capabilities(&self) -> AggregatedCapabilities {
        self.shared
            .state
            .lock()
            .map(|state| state.aggregate.snapshot())
            .unwrap_or_default()
    }

    /// Per-server statistics, in configuration order.
    #[must_use]
    pub fn status(&self) -> Vec<ServerStatus> {
        let Ok(state) = self.shared.state.lock() else {
            return Vec::new();
        };
        state
            .servers
            .iter()
            .map(|(name, entry)| {
                let (tools, resources, prompts) = entry.client.as_ref().map_or((0, 0, 0), |client| {
                    (client.tools().len(), client.resources().len(), client.prompts().len())
                });
                ServerStatus {
                    name: name.clone(),
                    state: entry.state,
                    retry_count: entry.retry_count,
                    last_error: entry.last_error.clone(),
                    tools,
                    resources,
                    prompts,
                }
            })
            .collect()
    }

    /// Calls a tool by its aggregate name.
    ///
    /// # Errors
    ///
    /// `ToolNotFound` for unknown names, else the owning client's error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let (client, original) = self.shared.route(CatalogKind::Tools, name)?;
        client.call_tool(&original, arguments).await
    }

    /// Reads a resource by its aggregate URI.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` for unknown URIs, else the owning client's error.
    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let (client, original) = self.shared.route(CatalogKind::Resources, uri)?;
        client.read_resource(&original).await
    }

    /// Renders a prompt by its aggregate name.
    ///
    /// # Errors
    ///
    /// `PromptNotFound` for unknown names, else the owning client's error.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: std::collections::HashMap<String, String>,
    ) -> McpResult<GetPromptResult> {
        let (client, original) = self.shared.route(CatalogKind::Prompts, name)?;
        client.get_prompt(&original, arguments).await
    }
}

impl ManagerShared {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn is_running(&self) -> bool {
        self.state.lock().is_ok_and(|state| state.running)
    }

    fn insert(&self, config: ServerConfig) -> McpResult<u64> {
        config
            .validate()
            .map_err(|e| McpError::invalid_params(e.to_string()))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| McpError::internal("manager state poisoned"))?;
        if state.servers.contains_key(&config.name) {
            return Err(McpError::invalid_params(format!("server '{}' already exists", config.name)));
        }
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst);
        state.servers.insert(
            config.name.clone(),
            Entry {
                config,
                epoch,
                state: ConnectionState::Disconnected,
                client: None,
                retry_count: 0,
                last_error: None,
                watcher: None,
                retry_task: None,
            },
        );
        Ok(epoch)
    }

    /// Resolves an aggregate entry to the owning client and its own name.
    fn route(&self, kind: CatalogKind, name: &str) -> McpResult<(McpClient, String)> {
        let state = self
            .state
            .lock()
            .map_err(|_| McpError::internal("manager state lock poisoned"))?;
        let (server, original) = state.aggregate.target(kind, name).ok_or_else(|| match kind {
            CatalogKind::Tools => McpError::ToolNotFound { name: name.to_string() },
            CatalogKind::Resources => McpError::ResourceNotFound { uri: name.to_string() },
            CatalogKind::Prompts => McpError::PromptNotFound { name: name.to_string() },
        })?;
        let client = state
            .servers
            .get(&server)
            .and_then(|entry| entry.client.clone())
            .ok_or_else(|| McpError::connection(format!("server '{server}' for '{name}' is not connected")))?;
        Ok((client, original))
    }

    /// Runs one connection attempt for `name` inside a concurrency slot.
    async fn connect_entry(self: &Arc<Self>, name: &str, epoch: u64) -> McpResult<()> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| McpError::internal("connection slots closed"))?;

        let config = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| McpError::internal("manager state poisoned"))?;
            let entry = state
                .servers
                .get_mut(name)
                .filter(|entry| entry.epoch == epoch)
                .ok_or_else(|| McpError::connection(format!("server '{name}' was removed")))?;
            if matches!(entry.state, ConnectionState::Connecting | ConnectionState::Connected) {
                return Ok(());
            }
            entry.state = ConnectionState::Connecting;
            entry.config.clone()
        };
        self.emit(ManagerEvent::ServerConnecting { server: name.to_string() });

        let attempt = match self.connector.create(&config, &self.options.client) {
            Ok(client) => client.connect().await.map(|()| client),
            Err(e) => Err(e),
        };

        match attempt {
            Ok(client) => self.adopt(name, epoch, client).await,
            Err(e) => {
                self.connect_failed(name, epoch, &e);
                Err(e)
            }
        }
    }

    /// Stores a freshly connected client and merges its catalog.
    async fn adopt(self: &Arc<Self>, name: &str, epoch: u64, client: McpClient) -> McpResult<()> {
        let tools = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| McpError::internal("manager state poisoned"))?;
            let current = state.servers.get(name).is_some_and(|entry| entry.epoch == epoch);
            if current {
                let separator = self.options.separator.clone();
                state.aggregate.purge(name);
                state.aggregate.merge(name, &separator, &client);
                if let Some(entry) = state.servers.get_mut(name) {
                    entry.client = Some(client.clone());
                    entry.state = ConnectionState::Connected;
                    entry.retry_count = 0;
                    entry.last_error = None;
                }
                Some(client.tools().len())
            } else {
                None
            }
        };
        let Some(tools) = tools else {
            client.close().await;
            return Err(McpError::connection(format!("server '{name}' was removed")));
        };

        let events = client.subscribe();
        let watcher = tokio::spawn(watch_client(Arc::downgrade(self), name.to_string(), epoch, client.clone(), events));
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.servers.get_mut(name).filter(|entry| entry.epoch == epoch) {
                if let Some(previous) = entry.watcher.replace(watcher) {
                    previous.abort();
                }
            } else {
                watcher.abort();
            }
        }

        tracing::info!(server = name, tools, "MCP server connected");
        self.emit(ManagerEvent::ServerConnected {
            server: name.to_string(),
            tools,
        });

        // A drop between connect and subscribe would otherwise go unnoticed.
        if !client.is_connected() {
            self.client_lost(name, epoch, &client, "disconnected during setup".to_string());
        }
        Ok(())
    }

    fn connect_failed(self: &Arc<Self>, name: &str, epoch: u64, error: &McpError) {
        let plan = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let running = state.running;
            let Some(entry) = state.servers.get_mut(name).filter(|entry| entry.epoch == epoch) else {
                return;
            };
            entry.state = ConnectionState::Failed;
            entry.last_error = Some(error.to_string());
            if running {
                self.plan_retry(entry)
            } else {
                None
            }
        };
        tracing::warn!(server = name, error = %error, will_retry = plan.is_some(), "MCP server connection failed");
        self.emit(ManagerEvent::ServerFailed {
            server: name.to_string(),
            error: error.to_string(),
            will_retry: plan.is_some(),
        });
        if let Some((attempt, delay)) = plan {
            self.spawn_retry(name, epoch, attempt, delay);
        }
    }

    /// Purges a disconnected client's entries and schedules a reconnect.
    fn client_lost(self: &Arc<Self>, name: &str, epoch: u64, client: &McpClient, reason: String) {
        let plan = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let running = state.running;
            let owns = state.servers.get(name).is_some_and(|entry| {
                entry.epoch == epoch && entry.client.as_ref().is_some_and(|c| c.same_as(client))
            });
            if !owns {
                return;
            }
            state.aggregate.purge(name);
            let Some(entry) = state.servers.get_mut(name) else {
                return;
            };
            entry.client = None;
            entry.watcher = None;
            entry.state = ConnectionState::Disconnected;
            entry.last_error = Some(reason.clone());
            if running {
                let plan = self.plan_retry(entry);
                if plan.is_none() {
                    entry.state = ConnectionState::Failed;
                }
                Some(plan)
            } else {
                None
            }
        };

        tracing::warn!(server = name, reason = %reason, "MCP server disconnected");
        self.emit(ManagerEvent::ServerDisconnected {
            server: name.to_string(),
            reason: reason.clone(),
        });
        match plan {
            Some(Some((attempt, delay))) => self.spawn_retry(name, epoch, attempt, delay),
            Some(None) => self.emit(ManagerEvent::ServerFailed {
                server: name.to_string(),
                error: reason,
                will_retry: false,
            }),
            None => {}
        }
    }

    /// Consumes one retry from the entry's budget.
    fn plan_retry(&self, entry: &mut Entry) -> Option<(u32, Duration)> {
        let attempt = entry.retry_count;
        let delay = self.options.retry.delay_for(attempt)?;
        entry.retry_count += 1;
        Some((attempt, delay))
    }

    fn spawn_retry(self: &Arc<Self>, name: &str, epoch: u64, attempt: u32, delay: Duration) {
        tracing::info!(server = name, attempt, delay_ms = delay.as_millis(), "Scheduling reconnect");
        self.emit(ManagerEvent::ReconnectScheduled {
            server: name.to_string(),
            attempt,
            delay,
        });

        let weak = Arc::downgrade(self);
        let server = name.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.is_running() {
                return;
            }
            // Failures schedule the next attempt themselves.
            let _ = shared.connect_entry(&server, epoch).await;
        });

        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.servers.get_mut(name).filter(|entry| entry.epoch == epoch) {
                // The previous handle belongs to the attempt that scheduled this one.
                entry.retry_task = Some(task);
            } else {
                task.abort();
            }
        }
    }

    /// Re-merges a server's entries after its catalog changed.
    fn catalog_changed(&self, name: &str, epoch: u64, client: &McpClient) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let owns = state.servers.get(name).is_some_and(|entry| {
                entry.epoch == epoch && entry.client.as_ref().is_some_and(|c| c.same_as(client))
            });
            if !owns {
                return;
            }
            state.aggregate.purge(name);
            state.aggregate.merge(name, &self.options.separator, client);
        }
        tracing::debug!(server = name, "Re-aggregated capabilities");
        self.emit(ManagerEvent::CapabilitiesChanged { server: name.to_string() });
    }

    fn start_health_checks(self: &Arc<Self>) {
        let interval = self.options.health_check_interval;
        if interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                shared.health_check().await;
            }
        });
        if let Ok(mut health) = self.health.lock() {
            if let Some(previous) = health.replace(task) {
                previous.abort();
            }
        }
    }

    /// Pings every connected client. Failures are reported, nothing more.
    async fn health_check(&self) {
        let clients: Vec<McpClient> = self
            .state
            .lock()
            .map(|state| state.servers.values().filter_map(|e| e.client.clone()).collect())
            .unwrap_or_default();

        let results = join_all(clients.iter().map(|client| async move { (client.name().to_string(), client.ping().await) })).await;
        for (server, alive) in results {
            if !alive {
                tracing::warn!(server = %server, "Health check failed");
                self.emit(ManagerEvent::HealthCheckFailed { server });
            }
        }
    }
}

async fn watch_client(
    manager: Weak<ManagerShared>,
    name: String,
    epoch: u64,
    client: McpClient,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(server = %name, skipped, "Client events lagged");
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if client.is_connected() {
                    manager.catalog_changed(&name, epoch, &client);
                    continue;
                }
                ClientEvent::Disconnected {
                    reason: "connection lost".to_string(),
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            ClientEvent::Disconnected { reason } => {
                manager.client_lost(&name, epoch, &client, reason);
                return;
            }
            ClientEvent::CatalogChanged(_) => manager.catalog_changed(&name, epoch, &client),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn backoff_doubles_until_budget_is_spent() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_attempts: 4,
        };
        let delays: Vec<_> = (0..5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            [
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                Some(Duration::from_millis(800)),
                None,
            ]
        );
    }

    #[test]
    fn backoff_saturates() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: u32::MAX,
        };
        assert!(policy.delay_for(40).is_some());
    }

    fn routed<T>(server: &str, name: &str, descriptor: T) -> (String, Routed<T>) {
        (
            name.to_string(),
            Routed {
                name: name.to_string(),
                server: server.to_string(),
                original_name: name.to_string(),
                descriptor,
            },
        )
    }

    #[test]
    fn collisions_are_prefixed_and_double_collisions_skipped() {
        let tool = |name: &str| Tool::new(name, "", serde_json::json!({}));
        let mut map: IndexMap<String, Routed<Tool>> = IndexMap::new();
        map.extend([routed("a", "x", tool("x")), routed("a", "b_y", tool("b_y"))]);
        map.insert("y".into(), routed("a", "y", tool("y")).1);

        merge_into(&mut map, "b", "_", vec![tool("x"), tool("y"), tool("z")], |t| t.name.clone());

        assert_eq!(map["b_x"].server, "b");
        assert_eq!(map["b_x"].original_name, "x");
        assert_eq!(map["x"].server, "a");
        // `b_y` was already taken by server a.
        assert_eq!(map["b_y"].server, "a");
        assert_eq!(map["z"].server, "b");
    }

    #[test]
    fn purge_removes_only_the_owner() {
        let mut aggregate = Aggregate::default();
        aggregate
            .tools
            .extend([routed("a", "x", Tool::new("x", "", serde_json::json!({})))]);
        aggregate
            .prompts
            .extend([routed("b", "p", Prompt { name: "p".into(), description: None, arguments: Vec::new() })]);
        aggregate.purge("a");
        assert!(aggregate.tools.is_empty());
        assert_eq!(aggregate.prompts.len(), 1);
    }

    #[test]
    fn targets_are_looked_up_per_catalog() {
        let mut aggregate = Aggregate::default();
        let (_, mut aliased) = routed("b", "x", Tool::new("x", "", serde_json::json!({})));
        aliased.name = "b_x".into();
        aggregate.tools.insert("b_x".into(), aliased);

        assert_eq!(
            aggregate.target(CatalogKind::Tools, "b_x"),
            Some(("b".to_string(), "x".to_string()))
        );
        assert_eq!(aggregate.target(CatalogKind::Tools, "x"), None);
        assert_eq!(aggregate.target(CatalogKind::Prompts, "b_x"), None);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_configs_are_rejected() {
        let manager = ServerManager::new(
            vec![ServerConfig::stdio("a", "true", Vec::new())],
            ManagerOptions::default(),
        );
        let mut duplicate = ServerConfig::stdio("a", "true", Vec::new());
        duplicate.enabled = false;
        assert!(matches!(
            manager.add_server(duplicate).await,
            Err(McpError::InvalidParams { .. })
        ));

        let mut nameless = ServerConfig::stdio("", "true", Vec::new());
        nameless.enabled = false;
        assert!(manager.add_server(nameless).await.is_err());
        assert_eq!(manager.server_names(), ["a"]);
    }

    #[tokio::test]
    async fn disabled_servers_are_tracked_but_not_connected() {
        let manager = ServerManager::new(Vec::new(), ManagerOptions::default());
        let mut config = ServerConfig::stdio("off", "true", Vec::new());
        config.enabled = false;
        manager.add_server(config).await.unwrap();

        assert_eq!(manager.server_state("off"), Some(ConnectionState::Disconnected));
        assert!(manager.clients().is_empty());
        assert!(manager.remove_server("off").await);
        assert!(!manager.remove_server("off").await);
    }

    #[tokio::test]
    async fn unknown_aggregate_names_are_not_found() {
        let manager = ServerManager::new(Vec::new(), ManagerOptions::default());
        assert!(matches!(
            manager.call_tool("x", serde_json::json!({})).await,
            Err(McpError::ToolNotFound { .. })
        ));
        assert!(matches!(
            manager.read_resource("x://y").await,
            Err(McpError::ResourceNotFound { .. })
        ));
        assert!(matches!(
            manager.get_prompt("p", std::collections::HashMap::new()).await,
            Err(McpError::PromptNotFound { .. })
        ));
    }
}
