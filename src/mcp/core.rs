//! Transport-agnostic protocol core.
//!
//! One [`ProtocolCore`] serves one logical connection. It owns:
//!
//! - the request ID counter and the map of outstanding requests
//! - the injected [`HandlerMap`] that inbound requests and notifications are
//!   dispatched through
//! - the [`Session`] handshake state shared with the handlers
//!
//! # Correlation
//!
//! Responses are matched to requests by ID only, so a peer may answer in any
//! order. An outstanding request ends in exactly one of three ways: its
//! response arrives, it is cancelled, or its timeout fires. Whichever comes
//! first removes the entry; later events for the same ID are logged and
//! dropped.
//!
//! # Dispatch
//!
//! Inbound messages are processed in arrival order. Notification handlers run
//! inline; request handlers run on their own task so a slow tool never blocks
//! the connection, and every request receives exactly one response.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::mcp::capabilities::Implementation;
use crate::mcp::error::{redact_message, McpError, McpResult};
use crate::mcp::protocol::{
    decode, encode, methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId, DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::mcp::transport::{EventReceiver, Transport, TransportEvent};
use crate::mcp::validation::validate_params;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Future returned by a request handler.
pub type HandlerFuture = BoxFuture<'static, McpResult<Value>>;

/// Handles one inbound request.
pub type RequestHandler = Arc<dyn Fn(Context, Option<Value>) -> HandlerFuture + Send + Sync>;

/// Handles one inbound notification.
pub type NotificationHandler = Arc<dyn Fn(Context, Option<Value>) + Send + Sync>;

/// Which side of the handshake this core plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sends `initialize`.
    Client,
    /// Answers `initialize` and gates everything else on the handshake.
    Server,
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet.
    Uninitialized,
    /// `initialize` is being handled.
    Initializing,
    /// Capabilities exchanged, waiting for `notifications/initialized`.
    Negotiated,
    /// Normal operation.
    Ready,
    /// The connection is closed.
    Closed,
}

/// What one side learned about the other during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Agreed protocol version.
    pub protocol_version: String,
    /// Peer name and version.
    pub implementation: Option<Implementation>,
    /// Capabilities the peer advertised.
    pub capabilities: Value,
}

/// Handshake state shared between the core and its handlers.
#[derive(Debug)]
pub struct Session {
    state: Mutex<HandshakeState>,
    peer: Mutex<Option<PeerInfo>>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::Uninitialized),
            peer: Mutex::new(None),
        }
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
            .lock()
            .map_or(HandshakeState::Closed, |state| *state)
    }

    /// Sets the handshake state unless the session is closed.
    pub fn set_state(&self, next: HandshakeState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != HandshakeState::Closed || next == HandshakeState::Closed {
                *state = next;
            }
        }
    }

    /// Moves from `from` to `to`, returning whether the move happened.
    pub fn advance(&self, from: HandshakeState, to: HandshakeState) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// What the peer told us during the handshake.
    #[must_use]
    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer.lock().ok().and_then(|peer| peer.clone())
    }

    /// Records what the peer told us during the handshake.
    pub fn set_peer(&self, info: PeerInfo) {
        if let Ok(mut peer) = self.peer.lock() {
            *peer = Some(info);
        }
    }
}

/// Outbound handle handlers use to notify the peer.
#[derive(Clone)]
pub struct Peer {
    transport: Arc<dyn Transport>,
}

impl Peer {
    /// Sends a notification to the peer.
    ///
    /// # Errors
    ///
    /// Returns a transport error if delivery fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let message = encode(&Message::Notification(JsonRpcNotification::new(method, params)))?;
        self.transport.send(message).await
    }

    /// Reports progress for a request that carried a progress token.
    ///
    /// # Errors
    ///
    /// Returns a transport error if delivery fails.
    pub async fn progress(&self, token: Value, progress: f64, total: Option<f64>, message: Option<&str>) -> McpResult<()> {
        let notification = JsonRpcNotification::progress(token, progress, total, message);
        self.transport
            .send(encode(&Message::Notification(notification))?)
            .await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("transport", &self.transport.kind())
            .finish()
    }
}

/// Everything a handler may need besides its params.
#[derive(Debug, Clone)]
pub struct Context {
    /// ID of the request being handled; `None` for notifications.
    pub request_id: Option<RequestId>,
    /// Outbound handle to the peer.
    pub peer: Peer,
    /// Shared handshake state.
    pub session: Arc<Session>,
}

/// Method name → handler table injected into a [`ProtocolCore`].
#[derive(Clone)]
pub struct HandlerMap {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl HandlerMap {
    /// Creates a table that answers `ping` and nothing else.
    #[must_use]
    pub fn new() -> Self {
        let mut map = Self {
            requests: HashMap::new(),
            notifications: HashMap::new(),
        };
        map.on_request(methods::PING, |_, _| async { Ok(json!({})) });
        map
    }

    /// Registers a request handler, replacing any previous one for `method`.
    pub fn on_request<F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |ctx, params| handler(ctx, params).boxed());
        self.requests.insert(method.to_string(), handler);
        self
    }

    /// Registers a notification handler, replacing any previous one for `method`.
    pub fn on_notification<F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Option<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Whether a request handler exists for `method`.
    #[must_use]
    pub fn handles(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }
}

impl Default for HandlerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        requests.sort();
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        notifications.sort();
        f.debug_struct("HandlerMap")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .finish()
    }
}

/// Settings for one core.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Label for log lines (usually the peer's configured name).
    pub label: String,
    /// Handshake side.
    pub side: Side,
    /// Default timeout for [`ProtocolCore::send_request`].
    pub request_timeout: Duration,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: usize,
}

impl CoreOptions {
    /// Options with default timeout and size cap.
    #[must_use]
    pub fn new(label: impl Into<String>, side: Side) -> Self {
        Self {
            label: label.into(),
            side,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

struct PendingRequest {
    method: String,
    sent_at: Instant,
    tx: oneshot::Sender<McpResult<Value>>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

fn take_pending(pending: &PendingMap, id: &RequestId) -> Option<PendingRequest> {
    pending.lock().ok().and_then(|mut map| map.remove(id))
}

/// Removes a pending entry when its caller stops waiting.
struct PendingGuard {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        take_pending(&self.pending, &self.id);
    }
}

/// An outbound request awaiting its response.
#[must_use = "a pending call does nothing unless its response is awaited"]
pub struct PendingCall {
    id: RequestId,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<McpResult<Value>>,
    guard: PendingGuard,
}

impl PendingCall {
    /// The request's ID.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Waits for the response, the timeout, or cancellation.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, a timeout error, `Cancelled`, or a
    /// connection error if the core closes first.
    pub async fn response(self) -> McpResult<Value> {
        let Self {
            method,
            timeout,
            rx,
            guard,
            ..
        } = self;
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::connection("closed")),
            Err(_) => Err(McpError::timeout(method, timeout)),
        };
        drop(guard);
        outcome
    }
}

/// Request/response correlation and dispatch for one connection.
pub struct ProtocolCore {
    transport: Arc<dyn Transport>,
    handlers: HandlerMap,
    options: CoreOptions,
    next_id: AtomicI64,
    pending: PendingMap,
    session: Arc<Session>,
    closed: AtomicBool,
    closing: Notify,
}

impl ProtocolCore {
    /// Creates a core over `transport` dispatching through `handlers`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, handlers: HandlerMap, options: CoreOptions) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handlers,
            options,
            next_id: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            session: Arc::new(Session::new()),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    /// The shared handshake state.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// An outbound handle to the peer.
    #[must_use]
    pub fn peer(&self) -> Peer {
        Peer {
            transport: Arc::clone(&self.transport),
        }
    }

    /// The options this core was built with.
    #[must_use]
    pub const fn options(&self) -> &CoreOptions {
        &self.options
    }

    /// Number of outstanding outbound requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map_or(0, |map| map.len())
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for its result using the default timeout.
    ///
    /// # Errors
    ///
    /// See [`PendingCall::response`]; also fails if the message cannot be sent.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.send_request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    /// Sends a request and waits for its result using `timeout`.
    ///
    /// # Errors
    ///
    /// See [`PendingCall::response`]; also fails if the message cannot be sent.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        self.start_request(method, params, timeout)
            .await?
            .response()
            .await
    }

    /// Sends a request and returns a handle to await or cancel it.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the core is closed, or the transport's
    /// error if the message cannot be sent.
    pub async fn start_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> McpResult<PendingCall> {
        if self.is_closed() {
            return Err(McpError::connection("closed"));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| McpError::internal("pending request map poisoned"))?
            .insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    sent_at: Instant::now(),
                    tx,
                },
            );
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        let message = encode(&Message::Request(JsonRpcRequest::new(id.clone(), method, params)))?;
        tracing::debug!(peer = %self.options.label, %id, method, "Sending request");
        self.transport.send(message).await?;

        Ok(PendingCall {
            id,
            method: method.to_string(),
            timeout,
            rx,
            guard,
        })
    }

    /// Sends a notification. No ID and no pending entry.
    ///
    /// # Errors
    ///
    /// Returns a connection error if closed, or the transport's error.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::connection("closed"));
        }
        tracing::debug!(peer = %self.options.label, method, "Sending notification");
        self.peer().notify(method, params).await
    }

    /// Cancels an outstanding request and tells the peer.
    ///
    /// Returns `false` if the request had already finished.
    pub async fn cancel(&self, id: &RequestId, reason: &str) -> bool {
        let Some(entry) = take_pending(&self.pending, id) else {
            return false;
        };
        let _ = entry.tx.send(Err(McpError::Cancelled {
            reason: reason.to_string(),
        }));
        let params = json!({ "requestId": id, "reason": reason });
        if let Err(e) = self.send_notification(methods::CANCELLED, Some(params)).await {
            tracing::debug!(peer = %self.options.label, error = %e, "Failed to send cancellation");
        }
        true
    }

    /// Rejects every outstanding request with a connection error and marks
    /// the core closed. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.set_state(HandshakeState::Closed);

        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .map(|mut map| map.drain().map(|(_, entry)| entry).collect())
            .unwrap_or_default();
        for entry in drained {
            let _ = entry.tx.send(Err(McpError::connection("closed")));
        }
        self.closing.notify_one();
        tracing::debug!(peer = %self.options.label, "Protocol core closed");
    }

    /// Drives the core from a transport's event stream until the transport
    /// closes or fails, or [`close`](Self::close) is called. Returns why it
    /// stopped.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) -> String {
        let reason = loop {
            if self.is_closed() {
                break "closed locally".to_string();
            }
            let event = tokio::select! {
                event = events.recv() => event,
                () = self.closing.notified() => break "closed locally".to_string(),
            };
            match event {
                Some(TransportEvent::Connected) => {
                    tracing::debug!(peer = %self.options.label, transport = self.transport.kind(), "Transport connected");
                }
                Some(TransportEvent::Message(raw)) => self.process_message(&raw).await,
                Some(TransportEvent::Error(error)) => {
                    tracing::warn!(peer = %self.options.label, error = %redact_message(&error), "Transport error");
                    break error;
                }
                Some(TransportEvent::Closed) | None => break "transport closed".to_string(),
            }
        };
        self.close();
        reason
    }

    /// Decodes, classifies and dispatches one inbound message.
    pub async fn process_message(self: &Arc<Self>, raw: &str) {
        tracing::trace!(peer = %self.options.label, bytes = raw.len(), "Inbound message");
        match decode(raw, self.options.max_message_size) {
            Ok(Message::Request(request)) => self.dispatch_request(request).await,
            Ok(Message::Response(response)) => self.resolve(response),
            Ok(Message::Notification(notification)) => self.dispatch_notification(notification).await,
            Err(err) => {
                tracing::warn!(peer = %self.options.label, error = %err.error, "Rejected inbound message");
                if err.respond {
                    self.respond(err.to_response()).await;
                }
            }
        }
    }

    fn context(&self, request_id: Option<RequestId>) -> Context {
        Context {
            request_id,
            peer: self.peer(),
            session: Arc::clone(&self.session),
        }
    }

    async fn respond(&self, response: JsonRpcResponse) {
        match encode(&Message::Response(response)) {
            Ok(message) => {
                if let Err(e) = self.transport.send(message).await {
                    tracing::warn!(peer = %self.options.label, error = %e, "Failed to send response");
                }
            }
            Err(e) => tracing::error!(peer = %self.options.label, error = %e, "Failed to encode response"),
        }
    }

    /// Checks handshake gating for the server side.
    fn admit(&self, method: &str) -> McpResult<()> {
        if method == methods::INITIALIZE {
            if self.session.advance(HandshakeState::Uninitialized, HandshakeState::Initializing) {
                return Ok(());
            }
            return Err(McpError::invalid_request("Server already initialised"));
        }
        if self.options.side == Side::Server
            && method != methods::PING
            && self.session.state() != HandshakeState::Ready
        {
            return Err(McpError::invalid_request("Server not initialised"));
        }
        Ok(())
    }

    async fn dispatch_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let JsonRpcRequest { id, method, params, .. } = request;
        tracing::debug!(peer = %self.options.label, %id, method = %method, "Dispatching request");

        if let Err(error) = self.admit(&method) {
            self.respond(JsonRpcResponse::failure(Some(id), error.to_error_object()))
                .await;
            return;
        }

        let prepared = validate_params(&method, params.as_ref())
            .map_err(McpError::from)
            .and_then(|()| {
                self.handlers
                    .requests
                    .get(&method)
                    .cloned()
                    .ok_or_else(|| McpError::MethodNotFound { method: method.clone() })
            });
        let handler = match prepared {
            Ok(handler) => handler,
            Err(error) => {
                if method == methods::INITIALIZE {
                    self.session.set_state(HandshakeState::Uninitialized);
                }
                self.respond(JsonRpcResponse::failure(Some(id), error.to_error_object()))
                    .await;
                return;
            }
        };

        let core = Arc::clone(self);
        let ctx = self.context(Some(id.clone()));
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler(ctx, params)).catch_unwind().await;
            let result = outcome.unwrap_or_else(|_| Err(McpError::internal(format!("handler for '{method}' panicked"))));

            if method == methods::INITIALIZE {
                let next = if result.is_ok() {
                    HandshakeState::Negotiated
                } else {
                    HandshakeState::Uninitialized
                };
                core.session.advance(HandshakeState::Initializing, next);
            }

            let response = match result {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(error) => {
                    tracing::debug!(peer = %core.options.label, method = %method, error = %error, "Request failed");
                    JsonRpcResponse::failure(Some(id), error.to_error_object())
                }
            };
            core.respond(response).await;
        });
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            tracing::warn!(peer = %self.options.label, response = ?response.payload, "Peer reported an error without a request id");
            return;
        };
        match take_pending(&self.pending, &id) {
            Some(entry) => {
                tracing::debug!(
                    peer = %self.options.label,
                    %id,
                    method = %entry.method,
                    elapsed_ms = entry.sent_at.elapsed().as_millis(),
                    "Response received"
                );
                let _ = entry.tx.send(response.into_result());
            }
            None => {
                tracing::warn!(peer = %self.options.label, %id, "Dropping late or duplicate response");
            }
        }
    }

    async fn dispatch_notification(&self, notification: JsonRpcNotification) {
        let JsonRpcNotification { method, params, .. } = notification;

        match method.as_str() {
            methods::CANCELLED => self.handle_cancelled(params.as_ref()),
            methods::INITIALIZED if self.options.side == Side::Server => {
                if self.session.advance(HandshakeState::Negotiated, HandshakeState::Ready) {
                    tracing::info!(peer = %self.options.label, "Handshake complete");
                } else {
                    tracing::warn!(peer = %self.options.label, state = ?self.session.state(), "Unexpected initialized notification");
                }
            }
            _ => {}
        }

        match self.handlers.notifications.get(&method) {
            Some(handler) => handler(self.context(None), params),
            None if method == methods::CANCELLED || method == methods::INITIALIZED => {}
            None => tracing::debug!(peer = %self.options.label, method = %method, "Dropped unhandled notification"),
        }
    }

    fn handle_cancelled(&self, params: Option<&Value>) {
        let Some(id) = params
            .and_then(|p| p.get("requestId"))
            .and_then(RequestId::from_value)
        else {
            tracing::debug!(peer = %self.options.label, "Cancellation without a request id");
            return;
        };
        let reason = params
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("cancelled by peer")
            .to_string();

        if let Some(entry) = take_pending(&self.pending, &id) {
            tracing::debug!(peer = %self.options.label, %id, reason = %reason, "Request cancelled by peer");
            let _ = entry.tx.send(Err(McpError::Cancelled { reason }));
        }
    }
}

impl std::fmt::Debug for ProtocolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCore")
            .field("label", &self.options.label)
            .field("side", &self.options.side)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{ErrorCode, ResponsePayload, DEFAULT_MAX_MESSAGE_SIZE};
    use crate::mcp::transport::MemoryTransport;

    struct Harness {
        core: Arc<ProtocolCore>,
        remote: MemoryTransport,
        remote_rx: EventReceiver,
    }

    async fn harness(side: Side, handlers: HandlerMap) -> Harness {
        let (local, remote) = MemoryTransport::pair();
        let local: Arc<dyn Transport> = Arc::new(local);
        let events = local.connect().await.unwrap();
        let remote_rx = remote.connect().await.unwrap();
        let mut options = CoreOptions::new("test", side);
        options.request_timeout = Duration::from_millis(500);
        let core = ProtocolCore::new(local, handlers, options);
        tokio::spawn(Arc::clone(&core).run(events));
        Harness {
            core,
            remote,
            remote_rx,
        }
    }

    impl Harness {
        async fn next(&mut self) -> Message {
            loop {
                match self.remote_rx.recv().await {
                    Some(TransportEvent::Message(raw)) => return decode(&raw, DEFAULT_MAX_MESSAGE_SIZE).unwrap(),
                    Some(_) => continue,
                    None => panic!("transport closed"),
                }
            }
        }

        async fn send(&self, raw: Value) {
            self.remote.send(raw.to_string()).await.unwrap();
        }

        async fn response(&mut self) -> JsonRpcResponse {
            match self.next().await {
                Message::Response(response) => response,
                other => panic!("expected response, got {other:?}"),
            }
        }
    }

    fn error_code(response: &JsonRpcResponse) -> i32 {
        match &response.payload {
            ResponsePayload::Error(error) => error.code,
            ResponsePayload::Result(result) => panic!("expected error, got {result}"),
        }
    }

    #[tokio::test]
    async fn request_resolves_with_result() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        let core = Arc::clone(&h.core);
        let call = tokio::spawn(async move { core.send_request("tools/list", None).await });

        let Message::Request(request) = h.next().await else {
            panic!("expected request");
        };
        assert_eq!(request.method, "tools/list");
        h.send(json!({"jsonrpc": "2.0", "id": request.id, "result": {"tools": []}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
        assert_eq!(h.core.pending_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_are_correlated_by_id() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        let first = h
            .core
            .start_request("a", None, Duration::from_secs(5))
            .await
            .unwrap();
        let second = h
            .core
            .start_request("b", None, Duration::from_secs(5))
            .await
            .unwrap();
        let (id_a, id_b) = (first.id().clone(), second.id().clone());
        assert_ne!(id_a, id_b);
        let _ = h.next().await;
        let _ = h.next().await;

        h.send(json!({"jsonrpc": "2.0", "id": id_b, "result": "b"})).await;
        h.send(json!({"jsonrpc": "2.0", "id": id_a, "result": "a"})).await;

        assert_eq!(first.response().await.unwrap(), json!("a"));
        assert_eq!(second.response().await.unwrap(), json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_is_removed() {
        let h = harness(Side::Client, HandlerMap::new()).await;
        let started = Instant::now();
        let err = h.core.send_request("slow", None).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(h.core.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_dropped() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        let err = h.core.send_request("slow", None).await.unwrap_err();
        assert!(err.is_timeout());

        let Message::Request(request) = h.next().await else {
            panic!("expected request");
        };
        h.send(json!({"jsonrpc": "2.0", "id": request.id, "result": {}})).await;
        tokio::task::yield_now().await;
        assert!(!h.core.is_closed());
        assert_eq!(h.core.pending_count(), 0);
    }

    #[tokio::test]
    async fn close_rejects_outstanding_requests() {
        let h = harness(Side::Client, HandlerMap::new()).await;
        let call = h
            .core
            .start_request("x", None, Duration::from_secs(5))
            .await
            .unwrap();
        h.core.close();
        h.core.close();

        let err = call.response().await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert_eq!(h.core.session().state(), HandshakeState::Closed);
        assert!(h.core.send_request("y", None).await.is_err());
    }

    #[tokio::test]
    async fn peer_cancellation_rejects_pending_request() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        let call = h
            .core
            .start_request("x", None, Duration::from_secs(5))
            .await
            .unwrap();
        let id = call.id().clone();
        let _ = h.next().await;

        h.send(json!({"jsonrpc": "2.0", "method": "notifications/cancelled",
                      "params": {"requestId": id, "reason": "user"}}))
            .await;
        let err = call.response().await.unwrap_err();
        assert_eq!(err, McpError::Cancelled { reason: "user".into() });
    }

    #[tokio::test]
    async fn outbound_cancel_notifies_peer() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        let call = h
            .core
            .start_request("x", None, Duration::from_secs(5))
            .await
            .unwrap();
        let id = call.id().clone();
        let _ = h.next().await;

        assert!(h.core.cancel(&id, "no longer needed").await);
        assert!(!h.core.cancel(&id, "again").await);
        assert!(matches!(call.response().await, Err(McpError::Cancelled { .. })));

        let Message::Notification(notification) = h.next().await else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, methods::CANCELLED);
        assert_eq!(notification.params.unwrap()["requestId"], json!(id));
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        h.send(json!({"jsonrpc": "2.0", "id": 9, "method": "nope"})).await;
        let response = h.response().await;
        assert_eq!(response.id, Some(RequestId::Number(9)));
        assert_eq!(error_code(&response), ErrorCode::MethodNotFound.code());
    }

    #[tokio::test]
    async fn invalid_params_rejected_before_handler_runs() {
        let mut handlers = HandlerMap::new();
        handlers.on_request(methods::TOOLS_CALL, |_, _| async {
            panic!("handler must not run");
        });
        let mut h = harness(Side::Client, handlers).await;

        h.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}}))
            .await;
        assert_eq!(error_code(&h.response().await), ErrorCode::InvalidParams.code());
    }

    #[tokio::test]
    async fn malformed_input_is_answered_in_band() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        h.remote.send("{not json".into()).await.unwrap();
        let response = h.response().await;
        assert_eq!(response.id, None);
        assert_eq!(error_code(&response), ErrorCode::ParseError.code());

        // The connection is still usable afterwards.
        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        assert_eq!(h.response().await.into_result().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn response_with_result_and_error_is_never_answered() {
        let mut h = harness(Side::Client, HandlerMap::new()).await;
        h.send(json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}}))
            .await;
        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        let response = h.response().await;
        assert_eq!(response.id, Some(RequestId::Number(2)));
    }

    #[tokio::test]
    async fn panicking_handler_still_gets_one_response() {
        let mut handlers = HandlerMap::new();
        handlers.on_request("boom", |_, _| async { panic!("kaboom") });
        let mut h = harness(Side::Client, handlers).await;

        h.send(json!({"jsonrpc": "2.0", "id": 3, "method": "boom"})).await;
        assert_eq!(error_code(&h.response().await), ErrorCode::InternalError.code());
    }

    #[tokio::test]
    async fn server_role_gates_on_handshake() {
        let mut handlers = HandlerMap::new();
        handlers.on_request(methods::INITIALIZE, |_, _| async { Ok(json!({"ok": true})) });
        handlers.on_request(methods::TOOLS_LIST, |_, _| async { Ok(json!({"tools": []})) });
        let mut h = harness(Side::Server, handlers).await;

        h.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await;
        assert_eq!(error_code(&h.response().await), ErrorCode::InvalidRequest.code());

        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "initialize",
                      "params": {"protocolVersion": "2024-11-05"}}))
            .await;
        assert!(h.response().await.into_result().is_ok());
        assert_eq!(h.core.session().state(), HandshakeState::Negotiated);

        h.send(json!({"jsonrpc": "2.0", "id": 3, "method": "initialize",
                      "params": {"protocolVersion": "2024-11-05"}}))
            .await;
        assert_eq!(error_code(&h.response().await), ErrorCode::InvalidRequest.code());

        h.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        h.send(json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"})).await;
        assert_eq!(h.response().await.into_result().unwrap(), json!({"tools": []}));
        assert_eq!(h.core.session().state(), HandshakeState::Ready);
    }

    #[tokio::test]
    async fn notifications_reach_handlers_and_unknown_ones_are_dropped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handlers = HandlerMap::new();
        handlers.on_notification("custom/event", move |_, params| {
            let _ = tx.send(params);
        });
        let h = harness(Side::Client, handlers).await;

        h.send(json!({"jsonrpc": "2.0", "method": "unknown/event"})).await;
        h.send(json!({"jsonrpc": "2.0", "method": "custom/event", "params": {"n": 1}}))
            .await;
        assert_eq!(rx.recv().await.unwrap(), Some(json!({"n": 1})));
        assert!(!h.core.is_closed());
    }

    #[tokio::test]
    async fn transport_close_ends_the_run_loop() {
        let h = harness(Side::Client, HandlerMap::new()).await;
        let call = h
            .core
            .start_request("x", None, Duration::from_secs(5))
            .await
            .unwrap();
        h.remote.close().await;

        assert!(matches!(call.response().await, Err(McpError::Connection { .. })));
        assert!(h.core.is_closed());
    }
}
