//! ragchat-mcp: Model Context Protocol stack for a retrieval-augmented chat application
//!
//! This library lets the application consume capabilities from external MCP
//! servers and expose its own retrieval backend as an MCP server.
//!
//! # Architecture
//!
//! - **Protocol core**: JSON-RPC 2.0 framing, validation, request/response
//!   correlation with per-request timeouts, cancellation
//! - **Transports**: newline-delimited JSON over stdio (own streams or a
//!   spawned subprocess) and HTTP (POST plus a server-sent event stream)
//! - **Client / Server**: the `initialize` handshake and the tools, resources
//!   and prompts methods on either side
//! - **Server manager**: many clients aggregated into one namespace with
//!   collision prefixing, health checks and reconnection backoff
//!
//! The retrieval pipeline itself sits behind the [`mcp::Backend`] trait.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Configuration error types
//! - [`mcp`]: MCP protocol implementation

pub mod config;
pub mod error;
pub mod mcp;
