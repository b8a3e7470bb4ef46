//! Capability descriptors and the in-memory capabilities registry.
//!
//! A [`CapabilityRegistry`] holds the tools, resources and prompts one peer
//! exposes. The server keeps its own catalog in one; the client keeps the
//! remote server's negotiated catalog in another. Identity is the tool or
//! prompt name and the resource URI, and registration order is preserved.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip_serializing_if requires a predicate fn(&T) -> bool, so we must take &bool here
const fn is_false(b: &bool) -> bool {
    !*b
}

/// A tool definition as advertised in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl Tool {
    /// Creates a tool descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

/// A resource definition as advertised in `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource URI (identity key).
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    /// Creates a JSON resource descriptor.
    #[must_use]
    pub fn json(uri: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: Some(description.into()),
            mime_type: Some("application/json".to_string()),
        }
    }
}

/// One declared prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
}

impl PromptArgument {
    /// Creates an argument descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            required,
        }
    }
}

/// A prompt definition as advertised in `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Unique prompt name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl Prompt {
    /// Names of the arguments that must be supplied.
    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
    }
}

/// Which catalog a change or refresh refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// `tools/*`
    Tools,
    /// `resources/*`
    Resources,
    /// `prompts/*`
    Prompts,
}

impl CatalogKind {
    /// The list-changed notification for this catalog.
    #[must_use]
    pub const fn list_changed_method(self) -> &'static str {
        use crate::mcp::protocol::methods;
        match self {
            Self::Tools => methods::TOOLS_LIST_CHANGED,
            Self::Resources => methods::RESOURCES_LIST_CHANGED,
            Self::Prompts => methods::PROMPTS_LIST_CHANGED,
        }
    }
}

/// `listChanged` capability flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether the peer emits list-changed notifications.
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Resource capability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Whether `resources/subscribe` is supported.
    #[serde(default, skip_serializing_if = "is_false")]
    pub subscribe: bool,
    /// Whether the peer emits list-changed notifications.
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    /// Resource-related capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Prompt-related capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    /// Present when the server emits `notifications/message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

impl ServerCapabilities {
    /// Whether the server advertised the given catalog.
    #[must_use]
    pub const fn supports(&self, kind: CatalogKind) -> bool {
        match kind {
            CatalogKind::Tools => self.tools.is_some(),
            CatalogKind::Resources => self.resources.is_some(),
            CatalogKind::Prompts => self.prompts.is_some(),
        }
    }
}

/// Client capabilities sent during initialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Roots capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<ListChangedCapability>,
    /// Sampling capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    /// Experimental, non-standard capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Name and version of a peer implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    #[serde(default)]
    pub version: String,
}

impl Implementation {
    /// Creates implementation info.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server speaks.
    pub protocol_version: String,
    /// Capabilities the server offers.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server name and version.
    pub server_info: Implementation,
    /// Optional usage hints for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One content item in a tool result or prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Encoded image bytes.
        data: String,
        /// Image MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource contents.
    Resource {
        /// The embedded resource.
        resource: ResourceContents,
    },
}

impl Content {
    /// Creates text content.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Returns the text, for text content.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content returned by the tool.
    pub content: Vec<Content>,
    /// Whether the tool call resulted in an error.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
        }
    }

    /// Concatenated text of every text content item.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Contents of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// MIME type of the contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 binary contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ResourceContents {
    /// Creates text contents.
    #[must_use]
    pub fn text(uri: impl Into<String>, mime_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some(mime_type.into()),
            text: Some(text.into()),
            blob: None,
        }
    }
}

/// Result of `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResult {
    /// The resource contents.
    pub contents: Vec<ResourceContents>,
    /// Whether reading failed; the contents then describe the failure.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side.
    User,
    /// The model side.
    Assistant,
}

/// One rendered prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Who speaks the message.
    pub role: Role,
    /// What is said.
    pub content: Content,
}

impl PromptMessage {
    /// Creates a user text message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::text(text),
        }
    }
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptResult {
    /// Description of the rendered prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The rendered messages.
    pub messages: Vec<PromptMessage>,
    /// Whether rendering failed; the messages then describe the failure.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

/// Catalog of tools, resources and prompts exposed by one peer.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    tools: IndexMap<String, Tool>,
    resources: IndexMap<String, Resource>,
    prompts: IndexMap<String, Prompt>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, returning `true` if it replaced one with the same name.
    pub fn register_tool(&mut self, tool: Tool) -> bool {
        self.tools.insert(tool.name.clone(), tool).is_some()
    }

    /// Registers a resource, returning `true` if it replaced one with the same URI.
    pub fn register_resource(&mut self, resource: Resource) -> bool {
        self.resources.insert(resource.uri.clone(), resource).is_some()
    }

    /// Registers a prompt, returning `true` if it replaced one with the same name.
    pub fn register_prompt(&mut self, prompt: Prompt) -> bool {
        self.prompts.insert(prompt.name.clone(), prompt).is_some()
    }

    /// Removes a tool by name.
    pub fn remove_tool(&mut self, name: &str) -> Option<Tool> {
        self.tools.shift_remove(name)
    }

    /// Looks up a tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Looks up a resource by URI.
    #[must_use]
    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.get(uri)
    }

    /// Looks up a prompt by name.
    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }

    /// All tools in registration order.
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.values().cloned().collect()
    }

    /// All resources in registration order.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.values().cloned().collect()
    }

    /// All prompts in registration order.
    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.values().cloned().collect()
    }

    /// Replaces the tool catalog wholesale.
    pub fn replace_tools(&mut self, tools: Vec<Tool>) {
        self.tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
    }

    /// Replaces the resource catalog wholesale.
    pub fn replace_resources(&mut self, resources: Vec<Resource>) {
        self.resources = resources.into_iter().map(|r| (r.uri.clone(), r)).collect();
    }

    /// Replaces the prompt catalog wholesale.
    pub fn replace_prompts(&mut self, prompts: Vec<Prompt>) {
        self.prompts = prompts.into_iter().map(|p| (p.name.clone(), p)).collect();
    }

    /// Empties one catalog.
    pub fn clear_kind(&mut self, kind: CatalogKind) {
        match kind {
            CatalogKind::Tools => self.tools.clear(),
            CatalogKind::Resources => self.resources.clear(),
            CatalogKind::Prompts => self.prompts.clear(),
        }
    }

    /// Empties every catalog.
    pub fn clear(&mut self) {
        self.tools.clear();
        self.resources.clear();
        self.prompts.clear();
    }

    /// Whether every catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.prompts.is_empty()
    }

    /// Capabilities to advertise for this catalog.
    #[must_use]
    pub fn server_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            resources: (!self.resources.is_empty()).then_some(ResourcesCapability {
                subscribe: true,
                list_changed: true,
            }),
            prompts: (!self.prompts.is_empty()).then_some(ListChangedCapability { list_changed: true }),
            logging: Some(Value::Object(serde_json::Map::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Tool {
        Tool::new("echo", "Echo text", json!({"type": "object"}))
    }

    #[test]
    fn registry_preserves_order_and_replaces_by_name() {
        let mut registry = CapabilityRegistry::new();
        assert!(!registry.register_tool(Tool::new("b", "", json!({}))));
        assert!(!registry.register_tool(echo()));
        assert!(registry.register_tool(Tool::new("b", "second", json!({}))));

        let names: Vec<_> = registry.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["b", "echo"]);
        assert_eq!(registry.tool("b").unwrap().description.as_deref(), Some("second"));
    }

    #[test]
    fn advertised_capabilities_follow_contents() {
        let mut registry = CapabilityRegistry::new();
        registry.register_tool(echo());
        let caps = registry.server_capabilities();
        assert!(caps.supports(CatalogKind::Tools));
        assert!(!caps.supports(CatalogKind::Resources));

        registry.register_resource(Resource::json("rag://documents", "Documents", "All documents"));
        assert!(registry.server_capabilities().supports(CatalogKind::Resources));
    }

    #[test]
    fn tool_wire_shape() {
        let value = serde_json::to_value(echo()).unwrap();
        assert_eq!(value["inputSchema"]["type"], "object");

        let parsed: Tool = serde_json::from_value(json!({"name": "bare"})).unwrap();
        assert!(parsed.description.is_none());
        assert_eq!(parsed.input_schema["type"], "object");
    }

    #[test]
    fn call_tool_result_shape() {
        let ok = serde_json::to_value(CallToolResult::text("hi")).unwrap();
        assert_eq!(ok, json!({"content": [{"type": "text", "text": "hi"}]}));

        let err = serde_json::to_value(CallToolResult::error("boom")).unwrap();
        assert_eq!(err["isError"], true);
    }

    #[test]
    fn required_prompt_arguments() {
        let prompt = Prompt {
            name: "rag_answer".into(),
            description: None,
            arguments: vec![
                PromptArgument::new("question", "", true),
                PromptArgument::new("context", "", false),
            ],
        };
        assert_eq!(prompt.required_arguments().collect::<Vec<_>>(), ["question"]);
    }

    #[test]
    fn clear_kind_leaves_other_catalogs() {
        let mut registry = CapabilityRegistry::new();
        registry.register_tool(echo());
        registry.register_resource(Resource::json("rag://documents", "Documents", ""));
        registry.clear_kind(CatalogKind::Tools);
        assert!(registry.tools().is_empty());
        assert_eq!(registry.resources().len(), 1);
        registry.clear();
        assert!(registry.is_empty());
    }
}
