// Core conversation types and the uniform provider adapter contract.
// Every provider (OpenAI-compatible, Anthropic, Gemini, Cerebras, Responses)
// implements the same interface; wire-format differences stay inside the
// concrete adapter.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;

use super::error::ProviderError;
use super::validator::InvalidToolCall;

// ============================================================================
// Messages
// ============================================================================

/// Message role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry in a conversation turn.
///
/// `content` carries plain text; richer payloads (images, tool use blocks,
/// thought signatures) live in `parts`. Tool messages reference the id of a
/// tool call produced by the immediately prior assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    /// Structured content parts, when the message is more than plain text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,

    /// Tool call ID (for tool responses)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls made by assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            parts: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Text content, flattening parts when present
    pub fn text(&self) -> String {
        match &self.parts {
            None => self.content.clone(),
            Some(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        out.push_str(text);
                    }
                }
                if out.is_empty() {
                    self.content.clone()
                } else {
                    out
                }
            }
        }
    }
}

/// Structured content payload within a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        content: String,
    },
    ThoughtSignature {
        signature: String,
    },
}

// ============================================================================
// Tools
// ============================================================================

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments (object with typed properties)
    pub parameters: serde_json::Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Tool names must start with a letter or underscore and stay within
    /// 64 word characters, the subset every provider accepts.
    pub fn is_valid_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// Tool call made by the LLM. `arguments` is the raw JSON string as
/// produced by the provider; it is only parsed during validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Parse the raw argument string into a JSON value
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// Tool execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the tool_call_id from ToolCall
    pub tool_call_id: String,

    /// Name of the tool that ran (some providers key results by name)
    pub tool_name: String,

    /// Result content (string or serialized JSON)
    pub content: String,

    /// Whether the tool execution failed
    pub is_error: bool,
}

// ============================================================================
// Streaming
// ============================================================================

/// A partial update emitted while consuming a provider stream
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Text content delta
    Content(String),

    /// Fragment of a tool call. `index` groups fragments belonging to the
    /// same call; id/name arrive once, argument JSON arrives in pieces.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
}

/// Per-chunk callback. Invoked in source order, never concurrently.
pub type ChunkSink<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

fn noop_chunk(_chunk: StreamChunk) {}

/// No-op sink for callers that only want the final result
pub fn null_sink() -> ChunkSink<'static> {
    static NOOP: fn(StreamChunk) = noop_chunk;
    &NOOP
}

/// Helper for assembling parallel tool calls from indexed deltas
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a tool call delta at a provider-assigned index
    pub fn process_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments_delta: Option<&str>,
    ) {
        while self.calls.len() <= index {
            self.calls.push(PartialToolCall::default());
        }
        let call = &mut self.calls[index];

        if let Some(id) = id {
            call.id.push_str(id);
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
        if let Some(delta) = arguments_delta {
            call.arguments.push_str(delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize in index order
    pub fn into_tool_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|partial| !partial.name.is_empty() || !partial.id.is_empty())
            .map(|partial| ToolCall {
                id: partial.id,
                name: partial.name,
                arguments: if partial.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    partial.arguments
                },
            })
            .collect()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancel token accepted by every adapter call. Cancelling closes the HTTP
/// stream, stops retry sleeping and surfaces a synthetic "cancelled"
/// assistant message upstream.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Owning side of a [`CancelToken`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// Create a linked handle/token pair
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that is never cancelled
    pub fn none() -> Self {
        // One process-wide sender keeps the channel open forever
        static NONE: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NONE.get_or_init(|| watch::channel(false).0);
        CancelToken { rx: tx.subscribe() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the token is cancelled. Pending forever for `none()`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never-cancelled
                futures::future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// Call context and results
// ============================================================================

/// Inline image attached to the current user turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub media_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

/// Per-call context shared by all adapters
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Images to inject into the last user message, model permitting
    pub images: Vec<ImagePayload>,

    /// Cooperative cancellation for the whole call
    pub cancel: CancelToken,

    /// Wall-clock limit for one provider request
    pub request_timeout: Duration,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            cancel: CancelToken::none(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Raw outcome of a single adapter attempt, before retry handling
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// Assistant message (content plus tool_calls)
    pub message: Message,

    /// Tool calls requested in this response, in arrival order
    pub tool_calls: Vec<ToolCall>,

    pub usage: TokenUsage,

    /// Set when the adapter had to drop tools to complete the request
    pub tools_skipped: Option<String>,
}

impl AdapterResponse {
    pub fn from_text(content: String, usage: TokenUsage) -> Self {
        Self {
            message: Message::assistant(content),
            tool_calls: Vec::new(),
            usage,
            tools_skipped: None,
        }
    }
}

/// Total (never-failing) result the retry engine hands upstream.
///
/// When all retries are exhausted the engine synthesizes an assistant
/// message explaining the failure and sets `recovered`; callers distinguish
/// real completions from recoveries by that flag alone.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
    pub recovered: bool,
    pub recovered_error: Option<String>,
    pub invalid_tool_calls: Vec<InvalidToolCall>,
    pub tools_skipped: Option<String>,
    pub usage: TokenUsage,
}

impl CallResult {
    pub fn recovery(user_message: String, error: String, usage: TokenUsage) -> Self {
        Self {
            message: Message::assistant(user_message),
            tool_calls: Vec::new(),
            recovered: true,
            recovered_error: Some(error),
            invalid_tool_calls: Vec::new(),
            tools_skipped: None,
            usage,
        }
    }
}

// ============================================================================
// Adapter contract
// ============================================================================

/// Uniform interface over all LLM providers.
///
/// Implementations translate the shared [`Message`]/[`Tool`] model to the
/// provider wire format and back. `call`/`call_stream` return a plain
/// `Result`; the retry engine layers recovery semantics on top.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider identifier ("openai", "anthropic", ...)
    fn provider_id(&self) -> &str;

    /// Model this adapter instance is bound to
    fn model(&self) -> &str;

    /// Output-token ceiling to request for this model
    fn max_output_tokens(&self) -> u32;

    /// Whether the model supports tool calling
    fn supports_tools(&self) -> bool {
        true
    }

    /// Non-streaming completion
    async fn call(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError>;

    /// Streaming completion; deltas are pushed through `on_chunk` in source
    /// order before the assembled response is returned
    async fn call_stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError>;

    /// Shape executed tool results into provider-correct continuation
    /// messages for the next request
    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message>;
}

/// Boxed adapter, the form the factory hands out
pub type DynAdapter = std::sync::Arc<dyn ProviderAdapter>;

/// Boxed stream of chunks, for callers that prefer pulling to callbacks
pub type ChunkStream = Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.tool_calls.is_none());

        let tool = Message::tool("call_1", "output");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn message_text_flattens_parts() {
        let msg = Message {
            role: Role::User,
            content: String::new(),
            parts: Some(vec![
                ContentPart::Text {
                    text: "a".to_string(),
                },
                ContentPart::Image {
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
                ContentPart::Text {
                    text: "b".to_string(),
                },
            ]),
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn tool_name_validation() {
        assert!(Tool::is_valid_name("add"));
        assert!(Tool::is_valid_name("_private"));
        assert!(Tool::is_valid_name("Tool_42"));
        assert!(!Tool::is_valid_name(""));
        assert!(!Tool::is_valid_name("9starts_with_digit"));
        assert!(!Tool::is_valid_name("has-dash"));
        assert!(!Tool::is_valid_name(&"x".repeat(65)));
        assert!(Tool::is_valid_name(&"x".repeat(64)));
    }

    #[test]
    fn assembler_concatenates_fragments_by_index() {
        let mut assembler = ToolCallAssembler::new();
        assembler.process_delta(0, Some("call_1"), Some("get_weather"), Some(r#"{"city": "#));
        assembler.process_delta(0, None, None, Some(r#""Tokyo"}"#));

        let calls = assembler.into_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(
            calls[0].parsed_arguments().unwrap()["city"],
            serde_json::json!("Tokyo")
        );
    }

    #[test]
    fn assembler_keeps_index_order_for_parallel_calls() {
        let mut assembler = ToolCallAssembler::new();
        // Second call's fragments may interleave with the first
        assembler.process_delta(1, Some("call_2"), Some("get_weather"), None);
        assembler.process_delta(0, Some("call_1"), Some("get_time"), Some("{}"));
        assembler.process_delta(1, None, None, Some(r#"{"city":"Paris"}"#));

        let calls = assembler.into_tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[1].id, "call_2");
    }

    #[test]
    fn assembler_defaults_empty_arguments_to_object() {
        let mut assembler = ToolCallAssembler::new();
        assembler.process_delta(0, Some("call_1"), Some("ping"), None);
        let calls = assembler.into_tool_calls();
        assert_eq!(calls[0].arguments, "{}");
    }

    #[tokio::test]
    async fn cancel_token_observes_handle() {
        let (handle, token) = CancelToken::pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn none_token_never_cancels() {
        let token = CancelToken::none();
        assert!(!token.is_cancelled());
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            token.cancelled(),
        )
        .await;
        assert!(waited.is_err());
    }
}
