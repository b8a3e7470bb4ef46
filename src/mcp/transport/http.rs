//! HTTP transport.
//!
//! One endpoint path carries the whole session:
//!
//! - `POST {path}` delivers exactly one inbound message (body = one envelope)
//!   and is acknowledged with `202 Accepted` before the message is handled
//! - `GET {path}` opens a `text/event-stream`; the first event is
//!   `connected` with the session ID, every later `message` event carries
//!   one outbound envelope (responses included)
//! - `DELETE {path}` ends the session and closes the transport
//! - `OPTIONS {path}` answers `200` with no body
//!
//! Outbound messages sent while no stream is open are held (the newest
//! `OUTBOUND_CAPACITY` of them) and replayed to the next stream that connects.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseFrame, KeepAlive},
        IntoResponse, Sse,
    },
    routing::post,
    Router,
};
use futures_util::{future, stream, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::mcp::transport::sse::SseDecoder;
use crate::mcp::transport::{event_channel, EventReceiver, Transport, TransportEvent};

/// Header carrying the session ID on every request after the stream opens.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Name of the SSE event that confirms a new stream.
pub const CONNECTED_EVENT: &str = "connected";

/// Name of the SSE event that carries one envelope.
pub const MESSAGE_EVENT: &str = "message";

const OUTBOUND_CAPACITY: usize = 256;
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Listener settings for the server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; zero picks a free one.
    pub port: u16,
    /// Endpoint path.
    pub path: String,
    /// Whether to send permissive CORS headers.
    pub cors: bool,
    /// Largest accepted POST body, in bytes.
    pub max_message_size: usize,
}

impl HttpServerConfig {
    /// Creates listener settings with CORS enabled and the default size cap.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            cors: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

struct Shared {
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    outbound: broadcast::Sender<String>,
    backlog: Mutex<VecDeque<String>>,
    session_id: String,
    shutdown: watch::Sender<bool>,
    connected: AtomicBool,
}

impl Shared {
    fn inbound(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.inbound.lock().ok().and_then(|guard| guard.clone())
    }

    fn session_matches(&self, headers: &HeaderMap) -> bool {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |id| id == self.session_id)
    }

    async fn end(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let inbound = self.inbound.lock().ok().and_then(|mut guard| guard.take());
        if let Some(inbound) = inbound {
            let _ = inbound.send(TransportEvent::Closed).await;
        }
        let _ = self.shutdown.send(true);
    }
}

async fn until_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

async fn post_message(State(shared): State<Arc<Shared>>, headers: HeaderMap, body: String) -> StatusCode {
    if !shared.session_matches(&headers) {
        return StatusCode::NOT_FOUND;
    }
    let Some(inbound) = shared.inbound() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    tracing::trace!(bytes = body.len(), "http <-");
    match inbound.send(TransportEvent::Message(body)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Outbound envelopes as SSE frames. A receiver that lags has lost
/// messages, so the stream ends and the client sees a disconnect.
fn live_frames(live: broadcast::Receiver<String>, session: String) -> impl Stream<Item = SseFrame> + Send {
    BroadcastStream::new(live)
        .take_while(move |item| {
            let keep = match item {
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %session, skipped, "SSE stream fell behind, closing it");
                    false
                }
                Ok(_) => true,
            };
            future::ready(keep)
        })
        .filter_map(|item| {
            future::ready(
                item.ok()
                    .map(|message| SseFrame::default().event(MESSAGE_EVENT).data(message)),
            )
        })
}

/// Holds `message` for the next stream, dropping the oldest past the cap.
fn hold(backlog: &mut VecDeque<String>, message: String) {
    if backlog.len() >= OUTBOUND_CAPACITY {
        backlog.pop_front();
        tracing::warn!(held = backlog.len(), "No SSE stream attached, dropped oldest outbound message");
    }
    backlog.push_back(message);
}

async fn open_stream(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    let (held, live) = match shared.backlog.lock() {
        Ok(mut backlog) => (backlog.drain(..).collect::<Vec<_>>(), shared.outbound.subscribe()),
        Err(_) => (Vec::new(), shared.outbound.subscribe()),
    };
    tracing::debug!(session = %shared.session_id, replayed = held.len(), "SSE stream opened");

    let hello = SseFrame::default()
        .event(CONNECTED_EVENT)
        .data(json!({ "sessionId": shared.session_id }).to_string());
    let replay = held
        .into_iter()
        .map(|message| SseFrame::default().event(MESSAGE_EVENT).data(message));
    let live = live_frames(live, shared.session_id.clone());

    let frames: std::pin::Pin<Box<dyn Stream<Item = Result<SseFrame, Infallible>> + Send>> = Box::pin(
        stream::iter(std::iter::once(hello).chain(replay))
            .chain(live)
            .map(Ok)
            .take_until(until_shutdown(shared.shutdown.subscribe())),
    );

    (
        [(SESSION_HEADER, shared.session_id.clone())],
        Sse::new(frames).keep_alive(KeepAlive::default()),
    )
}

async fn end_session(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> StatusCode {
    if !shared.session_matches(&headers) {
        return StatusCode::NOT_FOUND;
    }
    tracing::info!(session = %shared.session_id, "HTTP session ended by client");
    shared.end().await;
    StatusCode::NO_CONTENT
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// Server role: an HTTP listener serving one MCP session.
pub struct HttpServerTransport {
    config: HttpServerConfig,
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServerTransport {
    /// Creates the transport; nothing is bound until [`Transport::connect`].
    #[must_use]
    pub fn new(config: HttpServerConfig) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                inbound: Mutex::new(None),
                outbound,
                backlog: Mutex::new(VecDeque::new()),
                session_id: uuid::Uuid::new_v4().to_string(),
                shutdown,
                connected: AtomicBool::new(false),
            }),
            local_addr: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// The bound address, once connected.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|guard| *guard)
    }

    /// The session ID announced to clients.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    fn router(&self) -> Router {
        let route = post(post_message)
            .get(open_stream)
            .delete(end_session)
            .options(preflight);
        let router = Router::new()
            .route(&self.config.path, route)
            .with_state(Arc::clone(&self.shared))
            .layer(DefaultBodyLimit::max(self.config.max_message_size))
            .layer(TraceLayer::new_for_http());
        if self.config.cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn connect(&self) -> McpResult<EventReceiver> {
        let stopped = *self.shared.shutdown.borrow();
        if stopped || self.is_connected() {
            return Err(McpError::transport("http server transport cannot be reused"));
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                McpError::transport(format!(
                    "failed to bind {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| McpError::transport(e.to_string()))?;
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(addr);
        }

        let (tx, rx) = event_channel();
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| McpError::transport("event channel closed"))?;
        if let Ok(mut guard) = self.shared.inbound.lock() {
            *guard = Some(tx);
        }
        self.shared.connected.store(true, Ordering::SeqCst);

        let app = self.router();
        let stop = until_shutdown(self.shared.shutdown.subscribe());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                tracing::error!(error = %e, "HTTP server error");
            }
        });
        if let Ok(mut guard) = self.server.lock() {
            *guard = Some(handle);
        }

        tracing::info!(%addr, path = %self.config.path, "HTTP transport listening");
        Ok(rx)
    }

    async fn send(&self, message: String) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::transport("not connected"));
        }
        let mut backlog = self
            .shared
            .backlog
            .lock()
            .map_err(|_| McpError::transport("http transport lock poisoned"))?;
        tracing::trace!(bytes = message.len(), "http ->");
        if self.shared.outbound.receiver_count() == 0 {
            hold(&mut backlog, message);
        } else if let Err(broadcast::error::SendError(message)) = self.shared.outbound.send(message) {
            hold(&mut backlog, message);
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.end().await;
        let handle = self.server.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                tracing::warn!("HTTP server did not stop in time");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Client role: one POST per outbound message, inbound over an SSE stream.
pub struct HttpClientTransport {
    url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    session_id: Mutex<Option<String>>,
    connected: Arc<AtomicBool>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpClientTransport {
    /// Creates a client for the endpoint at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            request_timeout,
            session_id: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stream_task: Mutex::new(None),
        }
    }

    /// The session ID announced by the server, once connected.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id() {
            Some(id) => request.header(SESSION_HEADER, id),
            None => request,
        }
    }

    fn classify(&self, verb: &str, error: &reqwest::Error) -> McpError {
        if error.is_timeout() {
            McpError::timeout(format!("http {verb}"), self.request_timeout)
        } else if error.is_connect() {
            McpError::transport(format!("{verb} {} failed to connect: {error}", self.url))
        } else {
            McpError::transport(format!("{verb} {} failed: {error}", self.url))
        }
    }
}

fn is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("text/event-stream"))
}

async fn read_stream(
    response: reqwest::Response,
    events: mpsc::Sender<TransportEvent>,
    ready: oneshot::Sender<Option<String>>,
    connected: Arc<AtomicBool>,
) {
    let mut ready = Some(ready);
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    let outcome = loop {
        match body.next().await {
            None => break TransportEvent::Closed,
            Some(Err(e)) => break TransportEvent::Error(format!("event stream failed: {e}")),
            Some(Ok(chunk)) => {
                for event in decoder.push(&chunk) {
                    if event.event == CONNECTED_EVENT {
                        let session = serde_json::from_str::<serde_json::Value>(&event.data)
                            .ok()
                            .and_then(|v| v.get("sessionId").and_then(|s| s.as_str()).map(str::to_string));
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(session);
                        }
                    } else if event.event == MESSAGE_EVENT {
                        tracing::trace!(bytes = event.data.len(), "sse <-");
                        if events.send(TransportEvent::Message(event.data)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let _ = events.send(outcome).await;
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn connect(&self) -> McpResult<EventReceiver> {
        if self.is_connected() {
            return Err(McpError::transport("already connected"));
        }

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.classify("GET", &e))?;
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "GET {} answered {}",
                self.url,
                response.status()
            )));
        }
        if !is_event_stream(response.headers()) {
            return Err(McpError::transport(format!(
                "GET {} did not return an event stream",
                self.url
            )));
        }

        let (tx, rx) = event_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| McpError::transport("event channel closed"))?;
        self.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(read_stream(response, tx, ready_tx, Arc::clone(&self.connected)));
        if let Ok(mut guard) = self.stream_task.lock() {
            *guard = Some(task);
        }

        match tokio::time::timeout(self.request_timeout, ready_rx).await {
            Ok(Ok(session)) => {
                tracing::info!(url = %self.url, session = ?session, "HTTP transport connected");
                if let Ok(mut guard) = self.session_id.lock() {
                    *guard = session;
                }
                Ok(rx)
            }
            Ok(Err(_)) => {
                self.close().await;
                Err(McpError::transport("event stream ended before it was confirmed"))
            }
            Err(_) => {
                self.close().await;
                Err(McpError::timeout("http GET", self.request_timeout))
            }
        }
    }

    async fn send(&self, message: String) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::transport("not connected"));
        }

        tracing::trace!(bytes = message.len(), "http ->");
        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(message);
        let response = self
            .with_session(request)
            .send()
            .await
            .map_err(|e| self.classify("POST", &e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(McpError::transport(format!(
                "POST {} answered {}",
                self.url,
                response.status()
            )))
        }
    }

    async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let task = self.stream_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }
        if !was_connected {
            return;
        }

        let request = self.client.delete(&self.url).timeout(self.request_timeout);
        if let Err(e) = self.with_session(request).send().await {
            tracing::debug!(error = %e, "Failed to end HTTP session");
        }
        if let Ok(mut guard) = self.session_id.lock() {
            guard.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
