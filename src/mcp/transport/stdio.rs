//! stdio transport.
//!
//! This module implements the stdio transport as specified by MCP:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from client
//! - stdout: sends messages to client
//! - stderr: may be used for logging (not MCP messages)
//!
//! The same [`StdioTransport`] serves both roles. In the server role it owns
//! this process's stdin/stdout; in the client role it spawns the server as a
//! subprocess and talks over the child's pipes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::mcp::transport::{event_channel, EventReceiver, Transport, TransportEvent};

/// How long a child gets to exit after its stdin closes before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One deframed unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line longer than the limit was discarded; carries its length.
    Oversized(usize),
}

/// Accumulates bytes and splits them into newline-terminated lines.
///
/// Partial lines persist across [`push`](Self::push) calls. Blank lines are
/// skipped and a trailing `\r` is stripped.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
    discarded: Option<usize>,
}

impl LineBuffer {
    /// Creates a buffer that discards lines longer than `limit` bytes.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            discarded: None,
        }
    }

    /// Feeds bytes in and returns every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if let Some(seen) = self.discarded.take() {
                frames.push(Frame::Oversized(seen + head.len()));
                continue;
            }

            self.buf.extend_from_slice(head);
            let mut line = std::mem::take(&mut self.buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.limit {
                frames.push(Frame::Oversized(line.len()));
            } else if !line.iter().all(u8::is_ascii_whitespace) {
                frames.push(Frame::Line(String::from_utf8_lossy(&line).into_owned()));
            }
        }

        if let Some(seen) = self.discarded.as_mut() {
            *seen += rest.len();
        } else {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.limit {
                self.discarded = Some(self.buf.len());
                self.buf.clear();
            }
        }

        frames
    }

    /// Bytes held for an unterminated line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Subprocess launch parameters for the client role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

enum Source {
    Streams(Mutex<Option<(BoxReader, BoxWriter)>>),
    Process(ProcessSpec),
}

/// A newline-delimited JSON transport over a pair of byte streams.
pub struct StdioTransport {
    source: Source,
    max_message_size: usize,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Server role: this process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Wraps an arbitrary reader/writer pair.
    #[must_use]
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let streams: (BoxReader, BoxWriter) = (Box::new(reader), Box::new(writer));
        Self::with_source(Source::Streams(Mutex::new(Some(streams))))
    }

    /// Client role: spawns `spec` on connect and talks over its pipes.
    #[must_use]
    pub fn spawn(spec: ProcessSpec) -> Self {
        Self::with_source(Source::Process(spec))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            writer: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the longest accepted line.
    #[must_use]
    pub const fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    fn open(&self) -> McpResult<(BoxReader, BoxWriter, Option<Child>)> {
        match &self.source {
            Source::Streams(streams) => {
                let (reader, writer) = streams
                    .lock()
                    .map_err(|_| McpError::transport("stdio transport lock poisoned"))?
                    .take()
                    .ok_or_else(|| McpError::transport("stdio streams cannot be reopened"))?;
                Ok((reader, writer, None))
            }
            Source::Process(spec) => {
                let mut child = Command::new(&spec.command)
                    .args(&spec.args)
                    .envs(&spec.env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| McpError::transport(format!("failed to spawn '{}': {e}", spec.command)))?;

                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| McpError::transport("child stdin unavailable"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| McpError::transport("child stdout unavailable"))?;
                if let Some(stderr) = child.stderr.take() {
                    self.track(tokio::spawn(forward_stderr(spec.command.clone(), stderr)));
                }

                tracing::info!(command = %spec.command, pid = ?child.id(), "Spawned MCP server process");
                Ok((Box::new(stdout), Box::new(stdin), Some(child)))
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    async fn stop_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "MCP server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server process did not exit, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill MCP server process");
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: BoxReader,
    events: mpsc::Sender<TransportEvent>,
    limit: usize,
    connected: Arc<AtomicBool>,
) {
    let mut lines = LineBuffer::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK];

    let outcome = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break TransportEvent::Closed,
            Ok(n) => {
                for frame in lines.push(&chunk[..n]) {
                    match frame {
                        Frame::Line(line) => {
                            tracing::trace!(bytes = line.len(), "stdio <-");
                            if events.send(TransportEvent::Message(line)).await.is_err() {
                                return;
                            }
                        }
                        Frame::Oversized(len) => {
                            tracing::warn!(bytes = len, limit, "Discarded oversized stdio message");
                        }
                    }
                }
            }
            Err(e) => break TransportEvent::Error(format!("stdio read failed: {e}")),
        }
    };

    if lines.pending() > 0 {
        tracing::debug!(bytes = lines.pending(), "Dropped unterminated line at end of stream");
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(outcome).await;
}

async fn forward_stderr(command: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(command = %command, "{line}");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> McpResult<EventReceiver> {
        if self.is_connected() {
            return Err(McpError::transport("already connected"));
        }

        let (reader, writer, child) = self.open()?;
        *self.writer.lock().await = Some(writer);
        *self.child.lock().await = child;

        let (tx, rx) = event_channel();
        self.connected.store(true, Ordering::SeqCst);
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| McpError::transport("event channel closed"))?;
        self.track(tokio::spawn(read_loop(
            reader,
            tx,
            self.max_message_size,
            Arc::clone(&self.connected),
        )));
        Ok(rx)
    }

    async fn send(&self, message: String) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::transport("not connected"));
        }

        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !message.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| McpError::transport("not connected"))?;

        tracing::trace!(bytes = message.len(), "stdio ->");
        let write = async {
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        write
            .await
            .map_err(|e| McpError::transport(format!("stdio write failed: {e}")))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.stop_child().await;

        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn partial_lines_persist_across_pushes() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(br#"{"jsonrpc":"2.0","#).is_empty());
        assert_eq!(buf.pending(), 17);

        let frames = buf.push(b"\"method\":\"ping\"}\n{\"a\":");
        assert_eq!(
            frames,
            vec![Frame::Line(r#"{"jsonrpc":"2.0","method":"ping"}"#.into())]
        );
        assert_eq!(buf.push(b"1}\r\n"), vec![Frame::Line(r#"{"a":1}"#.into())]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut buf = LineBuffer::new(1024);
        assert_eq!(buf.push(b"\n  \r\nx\n"), vec![Frame::Line("x".into())]);
    }

    #[test]
    fn oversized_lines_are_discarded_once() {
        let mut buf = LineBuffer::new(4);
        assert!(buf.push(b"abcdef").is_empty());
        assert_eq!(buf.pending(), 0);
        assert_eq!(buf.push(b"gh\nok\n"), vec![Frame::Oversized(8), Frame::Line("ok".into())]);
        assert_eq!(buf.push(b"toolong\n"), vec![Frame::Oversized(7)]);
    }

    #[tokio::test]
    async fn frames_messages_over_streams() {
        let (client_side, server_side) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let transport = StdioTransport::from_streams(server_read, server_write);
        let mut events = transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let (mut peer_read, mut peer_write) = tokio::io::split(client_side);
        peer_write.write_all(b"{\"a\":1}\n{\"b\"").await.unwrap();
        peer_write.write_all(b":2}\n").await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Message(r#"{"a":1}"#.into())));
        assert_eq!(events.recv().await, Some(TransportEvent::Message(r#"{"b":2}"#.into())));

        transport.send(r#"{"c":3}"#.into()).await.unwrap();
        let mut out = vec![0u8; 8];
        peer_read.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"{\"c\":3}\n");

        drop(peer_write);
        drop(peer_read);
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_and_stream_continues() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"padding\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}\n")
            .read(b"{\"ok\":1}\n")
            .build();
        let transport = StdioTransport::from_streams(reader, tokio::io::sink()).with_max_message_size(16);
        let mut events = transport.connect().await.unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(events.recv().await, Some(TransportEvent::Message(r#"{"ok":1}"#.into())));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = duplex(64);
        let (r, w) = tokio::io::split(a);
        let transport = StdioTransport::from_streams(r, w);
        let _events = transport.connect().await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(matches!(
            transport.send("{}".into()).await,
            Err(McpError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transport_error() {
        let transport = StdioTransport::spawn(ProcessSpec {
            command: "/definitely/not/a/real/binary".into(),
            args: Vec::new(),
            env: HashMap::new(),
        });
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("failed to spawn"));
    }
}
