//! The capability surface the server delegates to.
//!
//! The server knows which tools, resources and prompts it advertises; a
//! [`Backend`] knows how to run them. [`MemoryBackend`] is a small in-memory
//! retrieval demo: documents are indexed from files, queries are answered by
//! keyword overlap, and every answered question is kept as a conversation
//! record.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::mcp::capabilities::{
    CallToolResult, GetPromptResult, PromptMessage, ReadResourceResult, ResourceContents,
};
use crate::mcp::core::Peer;

/// Default number of documents `rag_query` returns.
pub const DEFAULT_TOP_K: usize = 3;

/// Failure inside a backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend has no such tool, resource or prompt.
    #[error("unknown {kind}: {name}")]
    Unknown {
        /// `tool`, `resource` or `prompt`.
        kind: &'static str,
        /// The name or URI asked for.
        name: String,
    },

    /// Arguments were missing or had the wrong shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Progress reporting handle passed to long-running tool calls.
///
/// Reporting is a no-op when the caller did not ask for progress.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    sink: Option<(Peer, Value)>,
}

impl Progress {
    /// A handle that discards every report.
    #[must_use]
    pub const fn none() -> Self {
        Self { sink: None }
    }

    pub(crate) const fn new(peer: Peer, token: Value) -> Self {
        Self {
            sink: Some((peer, token)),
        }
    }

    /// Whether reports reach a peer.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Sends a `notifications/progress` update if the caller asked for one.
    pub async fn report(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        if let Some((peer, token)) = &self.sink {
            if let Err(e) = peer.progress(token.clone(), progress, total, message).await {
                tracing::debug!(error = %e, "Failed to deliver progress");
            }
        }
    }
}

/// What the server calls to execute a capability.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Runs a tool.
    async fn call(&self, tool: &str, arguments: Map<String, Value>, progress: Progress) -> Result<CallToolResult, BackendError>;

    /// Reads a resource.
    async fn read(&self, uri: &str) -> Result<ReadResourceResult, BackendError>;

    /// Renders a prompt.
    async fn get(&self, prompt: &str, arguments: &HashMap<String, String>) -> Result<GetPromptResult, BackendError>;
}

/// One indexed document.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// Stable identifier, `doc-<n>`.
    pub id: String,
    /// Where the content came from.
    pub source: String,
    /// Full text.
    pub content: String,
    /// When it was indexed.
    pub indexed_at: DateTime<Utc>,
}

/// One answered question.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    /// The question asked.
    pub question: String,
    /// IDs of the documents the answer drew from.
    pub sources: Vec<String>,
    /// When it was asked.
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Store {
    documents: IndexMap<String, Document>,
    conversations: Vec<Conversation>,
    next_id: usize,
}

/// In-memory keyword retrieval backend.
#[derive(Debug)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    started_at: DateTime<Utc>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            started_at: Utc::now(),
        }
    }

    /// A backend seeded with a short description of itself.
    #[must_use]
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.add_document(
            "builtin:overview",
            "ragchat-mcp exposes a retrieval backend over the Model Context Protocol. \
             Use rag_index to add documents, rag_query to search them and rag_status to inspect the index.",
        );
        backend.add_document(
            "builtin:transports",
            "The server speaks newline-delimited JSON-RPC over stdio, or HTTP with POST for \
             client messages and a server-sent event stream for server messages.",
        );
        backend
    }

    /// Indexes `content` under `source`, returning the new document ID.
    pub fn add_document(&self, source: impl Into<String>, content: impl Into<String>) -> String {
        let Ok(mut store) = self.store.lock() else {
            return String::new();
        };
        store.next_id += 1;
        let id = format!("doc-{}", store.next_id);
        store.documents.insert(
            id.clone(),
            Document {
                id: id.clone(),
                source: source.into(),
                content: content.into(),
                indexed_at: Utc::now(),
            },
        );
        id
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.store.lock().map_or(0, |store| store.documents.len())
    }

    /// Documents ranked by keyword overlap with `question`, best first.
    #[must_use]
    pub fn search(&self, question: &str, top_k: usize) -> Vec<Document> {
        let terms = keywords(question);
        if terms.is_empty() {
            return Vec::new();
        }
        let Ok(store) = self.store.lock() else {
            return Vec::new();
        };

        let mut scored: Vec<(usize, &Document)> = store
            .documents
            .values()
            .filter_map(|doc| {
                let words = keywords(&doc.content);
                let score = terms.iter().filter(|t| words.contains(*t)).count();
                (score > 0).then_some((score, doc))
            })
            .collect();
        // Stable sort keeps index order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(top_k)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    fn stats(&self) -> Value {
        let (documents, conversations, characters) = self.store.lock().map_or((0, 0, 0), |store| {
            (
                store.documents.len(),
                store.conversations.len(),
                store.documents.values().map(|d| d.content.chars().count()).sum::<usize>(),
            )
        });
        json!({
            "documents": documents,
            "conversations": conversations,
            "characters": characters,
            "startedAt": self.started_at.to_rfc3339(),
            "uptimeSeconds": (Utc::now() - self.started_at).num_seconds(),
        })
    }

    fn query(&self, arguments: &Map<String, Value>) -> Result<CallToolResult, BackendError> {
        let question = required_str(arguments, "question")?;
        let top_k = match arguments.get("top_k") {
            None | Some(Value::Null) => DEFAULT_TOP_K,
            Some(value) => value
                .as_u64()
                .filter(|k| *k > 0)
                .and_then(|k| usize::try_from(k).ok())
                .ok_or_else(|| BackendError::InvalidArguments("top_k must be a positive integer".into()))?,
        };

        let hits = self.search(question, top_k);
        if let Ok(mut store) = self.store.lock() {
            store.conversations.push(Conversation {
                question: question.to_string(),
                sources: hits.iter().map(|d| d.id.clone()).collect(),
                asked_at: Utc::now(),
            });
        }

        if hits.is_empty() {
            return Ok(CallToolResult::text(format!("No indexed documents match \"{question}\".")));
        }
        let mut answer = format!("Found {} relevant document(s) for \"{question}\":\n", hits.len());
        for doc in &hits {
            answer.push_str(&format!("\n[{}] {}\n{}\n", doc.id, doc.source, excerpt(&doc.content, 240)));
        }
        Ok(CallToolResult::text(answer.trim_end()))
    }

    #[allow(clippy::cast_precision_loss)]
    async fn index(&self, arguments: &Map<String, Value>, progress: &Progress) -> Result<CallToolResult, BackendError> {
        let paths: Vec<&str> = match arguments.get("paths") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| BackendError::InvalidArguments("paths must be strings".into()))
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(BackendError::InvalidArguments("paths must be an array".into())),
        };
        if paths.is_empty() {
            return Err(BackendError::InvalidArguments("paths must not be empty".into()));
        }

        let total = paths.len() as f64;
        let mut indexed = Vec::new();
        let mut failures = Vec::new();
        for (done, path) in paths.iter().enumerate() {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let id = self.add_document(*path, content);
                    tracing::debug!(path, id = %id, "Indexed document");
                    indexed.push(id);
                }
                Err(e) => failures.push(format!("{path}: {e}")),
            }
            progress
                .report((done + 1) as f64, Some(total), Some(path))
                .await;
        }

        if indexed.is_empty() {
            return Err(BackendError::Failed(format!("no documents indexed: {}", failures.join("; "))));
        }
        let mut summary = format!("Indexed {} of {} document(s): {}", indexed.len(), paths.len(), indexed.join(", "));
        if !failures.is_empty() {
            summary.push_str(&format!("\nSkipped: {}", failures.join("; ")));
        }
        Ok(CallToolResult::text(summary))
    }

    fn find_document(&self, reference: &str) -> Option<Document> {
        let store = self.store.lock().ok()?;
        let id = reference.strip_prefix("rag://documents/").unwrap_or(reference);
        store
            .documents
            .get(id)
            .or_else(|| store.documents.values().find(|d| d.source == reference))
            .cloned()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn call(&self, tool: &str, arguments: Map<String, Value>, progress: Progress) -> Result<CallToolResult, BackendError> {
        match tool {
            "rag_query" => self.query(&arguments),
            "rag_index" => self.index(&arguments, &progress).await,
            "rag_status" => Ok(CallToolResult::text(pretty(&self.stats()))),
            other => Err(BackendError::Unknown {
                kind: "tool",
                name: other.to_string(),
            }),
        }
    }

    async fn read(&self, uri: &str) -> Result<ReadResourceResult, BackendError> {
        let body = match uri {
            "rag://documents" => {
                let store = self
                    .store
                    .lock()
                    .map_err(|_| BackendError::Failed("document store unavailable".into()))?;
                let listing: Vec<Value> = store
                    .documents
                    .values()
                    .map(|d| {
                        json!({
                            "id": d.id,
                            "source": d.source,
                            "characters": d.content.chars().count(),
                            "indexedAt": d.indexed_at.to_rfc3339(),
                        })
                    })
                    .collect();
                Value::Array(listing)
            }
            "rag://conversations" => {
                let store = self
                    .store
                    .lock()
                    .map_err(|_| BackendError::Failed("conversation store unavailable".into()))?;
                serde_json::to_value(&store.conversations).map_err(|e| BackendError::Failed(e.to_string()))?
            }
            "rag://system/stats" => self.stats(),
            other => {
                return Err(BackendError::Unknown {
                    kind: "resource",
                    name: other.to_string(),
                })
            }
        };
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(uri, "application/json", pretty(&body))],
            is_error: false,
        })
    }

    async fn get(&self, prompt: &str, arguments: &HashMap<String, String>) -> Result<GetPromptResult, BackendError> {
        match prompt {
            "rag_answer" => {
                let question = arguments
                    .get("question")
                    .ok_or_else(|| BackendError::InvalidArguments("question is required".into()))?;
                let context = match arguments.get("context") {
                    Some(context) => context.clone(),
                    None => self
                        .search(question, DEFAULT_TOP_K)
                        .iter()
                        .map(|d| format!("[{}] {}", d.source, excerpt(&d.content, 400)))
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                };
                let context = if context.is_empty() {
                    "(no matching documents)".to_string()
                } else {
                    context
                };
                Ok(GetPromptResult {
                    description: Some("Answer a question from retrieved context".into()),
                    messages: vec![PromptMessage::user(format!(
                        "Answer the question using only the context below. \
                         Say so if the context does not contain the answer.\n\n\
                         Context:\n{context}\n\nQuestion: {question}"
                    ))],
                    is_error: false,
                })
            }
            "summarize_document" => {
                let uri = arguments
                    .get("uri")
                    .ok_or_else(|| BackendError::InvalidArguments("uri is required".into()))?;
                let doc = self
                    .find_document(uri)
                    .ok_or_else(|| BackendError::Failed(format!("no indexed document matches {uri}")))?;
                Ok(GetPromptResult {
                    description: Some(format!("Summarise {}", doc.source)),
                    messages: vec![PromptMessage::user(format!(
                        "Summarise the following document in a few sentences.\n\n{}",
                        doc.content
                    ))],
                    is_error: false,
                })
            }
            other => Err(BackendError::Unknown {
                kind: "prompt",
                name: other.to_string(),
            }),
        }
    }
}

fn required_str<'a>(arguments: &'a Map<String, Value>, field: &str) -> Result<&'a str, BackendError> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| BackendError::InvalidArguments(format!("{field} is required")))
}

/// Lowercased words of three or more characters.
fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn query_ranks_by_keyword_overlap() {
        let backend = MemoryBackend::new();
        backend.add_document("a.txt", "Tokio is an async runtime for Rust");
        backend.add_document("b.txt", "Rust async runtime with tokio timers and tokio channels");
        backend.add_document("c.txt", "Gardening tips for spring");

        let hits = backend.search("tokio async timers", 5);
        let sources: Vec<_> = hits.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(sources, ["b.txt", "a.txt"]);

        let result = backend
            .call("rag_query", args(json!({"question": "gardening"})), Progress::none())
            .await
            .unwrap();
        assert!(result.joined_text().contains("c.txt"));
    }

    #[tokio::test]
    async fn query_without_matches_says_so_and_is_recorded() {
        let backend = MemoryBackend::new();
        let result = backend
            .call("rag_query", args(json!({"question": "anything"})), Progress::none())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.joined_text().contains("No indexed documents"));

        let conversations = backend.read("rag://conversations").await.unwrap();
        let text = conversations.contents[0].text.clone().unwrap();
        assert!(text.contains("anything"));
    }

    #[tokio::test]
    async fn query_rejects_bad_arguments() {
        let backend = MemoryBackend::new();
        let err = backend
            .call("rag_query", args(json!({})), Progress::none())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidArguments(_)));

        let err = backend
            .call("rag_query", args(json!({"question": "x", "top_k": 0})), Progress::none())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn index_reads_files_and_reports_skips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Indexed content about lighthouses").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let backend = MemoryBackend::new();
        let result = backend
            .call(
                "rag_index",
                args(json!({"paths": [path, "/definitely/missing.txt"]})),
                Progress::none(),
            )
            .await
            .unwrap();
        assert!(result.joined_text().contains("Indexed 1 of 2"));
        assert!(result.joined_text().contains("Skipped"));
        assert_eq!(backend.document_count(), 1);
        assert_eq!(backend.search("lighthouses", 1).len(), 1);
    }

    #[tokio::test]
    async fn index_fails_when_nothing_was_read() {
        let backend = MemoryBackend::new();
        let err = backend
            .call("rag_index", args(json!({"paths": ["/missing"]})), Progress::none())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[tokio::test]
    async fn resources_are_json() {
        let backend = MemoryBackend::demo();
        for uri in ["rag://documents", "rag://conversations", "rag://system/stats"] {
            let result = backend.read(uri).await.unwrap();
            let text = result.contents[0].text.as_deref().unwrap();
            assert!(serde_json::from_str::<Value>(text).is_ok(), "{uri}");
            assert_eq!(result.contents[0].mime_type.as_deref(), Some("application/json"));
        }
        assert!(matches!(
            backend.read("rag://nope").await,
            Err(BackendError::Unknown { kind: "resource", .. })
        ));
    }

    #[tokio::test]
    async fn prompts_render_context() {
        let backend = MemoryBackend::new();
        let id = backend.add_document("notes.md", "The lighthouse keeper logs every ship.");

        let mut arguments = HashMap::new();
        arguments.insert("question".to_string(), "Who logs ships at the lighthouse?".to_string());
        let prompt = backend.get("rag_answer", &arguments).await.unwrap();
        let text = prompt.messages[0].content.as_text().unwrap();
        assert!(text.contains("lighthouse keeper"));
        assert!(text.contains("Question: Who logs"));

        let mut arguments = HashMap::new();
        arguments.insert("uri".to_string(), format!("rag://documents/{id}"));
        let prompt = backend.get("summarize_document", &arguments).await.unwrap();
        assert!(prompt.description.unwrap().contains("notes.md"));

        assert!(backend.get("summarize_document", &HashMap::new()).await.is_err());
    }

    #[test]
    fn excerpt_truncates_on_char_boundaries() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("short", 10), "short");
    }
}
