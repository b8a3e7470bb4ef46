//! End-to-end tests of the client against the built-in server over an
//! in-process transport pair.

use std::collections::HashMap;
use std::sync::Arc;

use ragchat_mcp::mcp::backend::MemoryBackend;
use ragchat_mcp::mcp::capabilities::Content;
use ragchat_mcp::mcp::client::{ClientEvent, ClientOptions, McpClient};
use ragchat_mcp::mcp::error::McpError;
use ragchat_mcp::mcp::server::{McpServer, ServerOptions};
use ragchat_mcp::mcp::transport::MemoryTransport;
use serde_json::{json, Value};

async fn connect(backend: MemoryBackend) -> (McpClient, McpServer) {
    let server = McpServer::new(Arc::new(backend), ServerOptions::default());
    let (client_end, server_end) = MemoryTransport::pair();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(Arc::new(server_end)).await });

    let client = McpClient::new("rag", Arc::new(client_end), ClientOptions::default());
    client.connect().await.unwrap();
    (client, server)
}

fn text_of(content: &Content) -> &str {
    match content {
        Content::Text { text } => text,
        other => panic!("expected text content, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_exposes_the_rag_catalog() {
    let (client, _server) = connect(MemoryBackend::demo()).await;

    let info = client.server_info().unwrap();
    assert_eq!(info.protocol_version, "2024-11-05");
    assert_eq!(info.server_info.name, env!("CARGO_PKG_NAME"));

    let tools: Vec<String> = client.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(tools, ["rag_query", "rag_index", "rag_status", "echo"]);
    let uris: Vec<String> = client.resources().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, ["rag://documents", "rag://conversations", "rag://system/stats"]);
    assert_eq!(client.prompts().len(), 2);
}

#[tokio::test]
async fn index_then_query_finds_the_new_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tides.txt");
    std::fs::write(&path, "Spring tides happen when the sun and moon align.").unwrap();
    let (client, _server) = connect(MemoryBackend::new()).await;

    let mut events = client.subscribe();
    let indexed = client
        .call_tool_with_progress("rag_index", json!({"paths": [path.to_str().unwrap()]}), json!("index-1"))
        .await
        .unwrap();
    assert!(!indexed.is_error, "{}", indexed.joined_text());
    assert!(indexed.joined_text().starts_with("Indexed 1 of 1"));

    match events.try_recv() {
        Ok(ClientEvent::Progress { token, progress, total, .. }) => {
            assert_eq!(token, json!("index-1"));
            assert!((progress - 1.0).abs() < f64::EPSILON);
            assert_eq!(total, Some(1.0));
        }
        other => panic!("expected progress, got {other:?}"),
    }

    let answer = client
        .call_tool("rag_query", json!({"question": "when do spring tides happen?"}))
        .await
        .unwrap();
    assert!(answer.joined_text().contains("tides.txt"));

    let conversations = client.read_resource("rag://conversations").await.unwrap();
    let body: Value = serde_json::from_str(conversations.contents[0].text.as_deref().unwrap()).unwrap();
    assert_eq!(body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn tool_failures_are_results_not_errors() {
    let (client, _server) = connect(MemoryBackend::demo()).await;

    let result = client
        .call_tool("rag_index", json!({"paths": ["/definitely/not/here.txt"]}))
        .await
        .unwrap();
    assert!(result.is_error);
    assert!(result.joined_text().starts_with("Execution failed:"));

    let result = client.call_tool("rag_query", json!({"top_k": 2})).await.unwrap();
    assert!(result.is_error);
    assert!(result.joined_text().starts_with("Invalid arguments:"));
}

#[tokio::test]
async fn stats_resource_is_json() {
    let (client, _server) = connect(MemoryBackend::demo()).await;

    let stats = client.read_resource("rag://system/stats").await.unwrap();
    let contents = &stats.contents[0];
    assert_eq!(contents.mime_type.as_deref(), Some("application/json"));
    let body: Value = serde_json::from_str(contents.text.as_deref().unwrap()).unwrap();
    assert_eq!(body["documents"], 2);
}

#[tokio::test]
async fn prompts_render_with_retrieved_context() {
    let (client, _server) = connect(MemoryBackend::demo()).await;

    let arguments = HashMap::from([("question".to_string(), "Which server speaks stdio?".to_string())]);
    let prompt = client.get_prompt("rag_answer", arguments).await.unwrap();
    let text = text_of(&prompt.messages[0].content);
    assert!(text.contains("builtin:transports"));
    assert!(text.ends_with("Question: Which server speaks stdio?"));

    let err = client.get_prompt("rag_answer", HashMap::new()).await.unwrap_err();
    assert!(matches!(err, McpError::InvalidParams { .. }));
}

#[tokio::test]
async fn tools_registered_later_reach_the_client() {
    let (client, server) = connect(MemoryBackend::demo()).await;
    let mut events = client.subscribe();

    server
        .register_tool(ragchat_mcp::mcp::capabilities::Tool::new(
            "rag_forget",
            "Drop a document from the index.",
            json!({"type": "object"}),
        ))
        .await;

    loop {
        if let ClientEvent::CatalogChanged(_) = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(client.tools().iter().any(|t| t.name == "rag_forget"));
}

#[tokio::test]
async fn resource_updates_follow_subscriptions() {
    let (client, server) = connect(MemoryBackend::demo()).await;
    let mut events = client.subscribe();

    assert!(!server.notify_resource_updated("rag://documents").await);
    client.subscribe_resource("rag://documents").await.unwrap();
    assert!(server.notify_resource_updated("rag://documents").await);

    assert_eq!(
        events.recv().await.unwrap(),
        ClientEvent::ResourceUpdated {
            uri: "rag://documents".into()
        }
    );
}
