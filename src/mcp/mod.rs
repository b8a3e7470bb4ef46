//! Model Context Protocol (MCP) client, server and connection manager.
//!
//! Both roles share one protocol core. A transport only moves framed
//! strings; the core correlates requests with responses and dispatches
//! inbound traffic through a handler table that the client or server
//! injects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ServerManager                         │
//! │     (slot pool · aggregate namespace · health · backoff)     │
//! │                              │                               │
//! │            ┌─────────────────┼─────────────────┐             │
//! │            ▼                 ▼                 ▼             │
//! │      ┌───────────┐     ┌───────────┐     ┌───────────┐       │
//! │      │ McpClient │     │ McpClient │     │ McpServer │       │
//! │      └─────┬─────┘     └─────┬─────┘     └─────┬─────┘       │
//! │            ▼                 ▼                 ▼             │
//! │   ┌─────────────────────────────────────────────────────┐    │
//! │   │       ProtocolCore (ids · pending · handlers)       │    │
//! │   └─────────────────────────────────────────────────────┘    │
//! │            │                 │                 │             │
//! │            ▼                 ▼                 ▼             │
//! │      ┌───────────┐     ┌───────────┐     ┌───────────┐       │
//! │      │   stdio   │     │   HTTP    │     │  memory   │       │
//! │      └───────────┘     └───────────┘     └───────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05 and refuses
//! to negotiate any other.

pub mod backend;
pub mod capabilities;
pub mod client;
pub mod core;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod validation;

pub use backend::{Backend, BackendError, MemoryBackend, Progress};
pub use client::{ClientEvent, ClientOptions, ConnectionState, McpClient};
pub use self::core::{CoreOptions, HandlerMap, ProtocolCore, Side};
pub use error::{McpError, McpResult};
pub use manager::{AggregatedCapabilities, Connector, ManagerEvent, ManagerOptions, ServerManager, ServerStatus};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, Message, RequestId, MCP_PROTOCOL_VERSION};
pub use server::{McpServer, ServerOptions};
pub use transport::{HttpClientTransport, HttpServerTransport, MemoryTransport, StdioTransport, Transport};
