//! In-process transport pair.
//!
//! Two [`MemoryTransport`]s created by [`MemoryTransport::pair`] are wired
//! back to back: whatever one sends arrives as a message event on the other.
//! Used to run a client against a server without pipes or sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::transport::{event_channel, EventReceiver, Transport, TransportEvent};

#[derive(Debug, Default)]
struct Link {
    to_peer: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

/// One end of an in-memory transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: Mutex<Option<EventReceiver>>,
    own: Arc<Link>,
    peer: Arc<Link>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = event_channel();
        let (tx_b, rx_b) = event_channel();
        let link_a = Arc::new(Link {
            to_peer: Mutex::new(Some(tx_b)),
        });
        let link_b = Arc::new(Link {
            to_peer: Mutex::new(Some(tx_a)),
        });

        let a = Self {
            inbound: Mutex::new(Some(rx_a)),
            own: Arc::clone(&link_a),
            peer: Arc::clone(&link_b),
            connected: AtomicBool::new(false),
        };
        let b = Self {
            inbound: Mutex::new(Some(rx_b)),
            own: link_b,
            peer: link_a,
            connected: AtomicBool::new(false),
        };
        (a, b)
    }

    fn sender(link: &Link) -> Option<mpsc::Sender<TransportEvent>> {
        link.to_peer.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> McpResult<EventReceiver> {
        let receiver = self
            .inbound
            .lock()
            .map_err(|_| McpError::transport("memory transport lock poisoned"))?
            .take()
            .ok_or_else(|| McpError::transport("memory transport cannot be reconnected"))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(receiver)
    }

    async fn send(&self, message: String) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::transport("not connected"));
        }
        let sender = Self::sender(&self.own).ok_or_else(|| McpError::transport("peer closed"))?;
        sender
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| McpError::transport("peer closed"))
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        // Tell the peer, then stop delivering to it.
        if let Some(sender) = Self::sender(&self.own) {
            let _ = sender.send(TransportEvent::Closed).await;
        }
        if let Ok(mut guard) = self.own.to_peer.lock() {
            guard.take();
        }
        // Anything the peer still sends to us is dropped.
        if let Ok(mut guard) = self.peer.to_peer.lock() {
            guard.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
