//! Byte transports beneath the protocol core.
//!
//! A transport frames and deframes serialised messages and never looks
//! inside them. Every implementation offers the same contract:
//!
//! - [`Transport::connect`] establishes the link and hands back the inbound
//!   event channel
//! - [`Transport::send`] delivers one serialised message and fails with a
//!   transport error when not connected
//! - [`Transport::close`] tears the link down and is idempotent
//!
//! Inbound traffic arrives as [`TransportEvent`]s on a bounded channel, so
//! exactly one task per connection owns the state transitions it causes.

pub mod http;
pub mod memory;
mod sse;
pub mod stdio;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::mcp::error::McpResult;

pub use http::{HttpClientTransport, HttpServerConfig, HttpServerTransport};
pub use memory::MemoryTransport;
pub use stdio::{LineBuffer, ProcessSpec, StdioTransport};

/// Capacity of every transport's inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The link is established.
    Connected,
    /// One complete inbound message.
    Message(String),
    /// A failure that ends the link.
    Error(String),
    /// The peer closed the link.
    Closed,
}

/// Inbound side of a connected transport.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Creates the bounded event channel transports deliver into.
#[must_use]
pub fn event_channel() -> (mpsc::Sender<TransportEvent>, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// A message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the link and returns the inbound event stream.
    ///
    /// # Errors
    ///
    /// Returns a transport or connection error if the link cannot be set up.
    async fn connect(&self) -> McpResult<EventReceiver>;

    /// Sends one serialised message.
    ///
    /// # Errors
    ///
    /// Returns a transport error if not connected or delivery fails.
    async fn send(&self, message: String) -> McpResult<()>;

    /// Closes the link. Calling it again is a no-op.
    async fn close(&self);

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}
