// Anthropic adapter using reqwest + SSE streaming.
// System messages are lifted to the top-level `system` field, tool results
// travel as a single user message of tool_result blocks, and streaming tool
// input arrives as raw JSON string fragments that are parsed exactly once
// when the content block closes.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::openai::STREAM_IDLE_TIMEOUT;
use super::provider::*;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        Self::with_base_url(ANTHROPIC_API_BASE, model, api_key)
    }

    /// Adapter pointed at an alternate endpoint (proxies, local stubs)
    pub fn with_base_url(
        base_url: impl Into<String>,
        model: String,
        api_key: String,
    ) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config(
                "Anthropic API key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Per-model output ceilings with safe defaults for unknown ids
    fn max_tokens_for(model: &str) -> u32 {
        if model.contains("claude-opus-4") {
            64_000
        } else if model.contains("claude-sonnet-4") || model.contains("claude-4") {
            32_000
        } else if model.contains("claude-3-5") || model.contains("claude-3-7") {
            8_192
        } else {
            4_096
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
        stream: bool,
    ) -> CreateMessageRequest {
        let (wire_messages, system) = build_anthropic_messages(messages, &ctx.images);

        CreateMessageRequest {
            model: self.model.clone(),
            max_tokens: self.max_output_tokens(),
            messages: wire_messages,
            system,
            stream: Some(stream),
            tools: if tools.is_empty() {
                None
            } else {
                Some(convert_tools(tools))
            },
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some(AnthropicToolChoice::Auto)
            },
        }
    }

    async fn send(
        &self,
        request: &CreateMessageRequest,
        ctx: &CallContext,
    ) -> Result<reqwest::Response, ProviderError> {
        let send = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .timeout(ctx.request_timeout)
            .send();

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = send => result?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::api(status, body));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_output_tokens(&self) -> u32 {
        Self::max_tokens_for(&self.model)
    }

    async fn call(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx, false);
        let response = self.send(&request, ctx).await?;
        let completed: CreateMessageResponse = response.json().await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in completed.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input.to_string(),
                    });
                }
                _ => {}
            }
        }

        let usage = TokenUsage {
            input_tokens: completed.usage.input_tokens,
            output_tokens: completed.usage.output_tokens,
        };

        let mut message = Message::assistant(content);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls.clone());
        }

        Ok(AdapterResponse {
            message,
            tool_calls,
            usage,
            tools_skipped: None,
        })
    }

    async fn call_stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx, true);
        let response = self.send(&request, ctx).await?;

        let event_stream = response.bytes_stream().eventsource();
        futures::pin_mut!(event_stream);

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = TokenUsage::default();
        // (block index, id, name, raw JSON accumulator). The raw string is
        // local to stream consumption and never reaches outbound messages.
        let mut open_tool: Option<(usize, String, String, String)> = None;

        loop {
            let event = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ProviderError::Cancelled),
                next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, event_stream.next()) => {
                    match next {
                        Err(_) => return Err(ProviderError::Timeout),
                        Ok(None) => break,
                        Ok(Some(Err(err))) => {
                            return Err(ProviderError::Stream(err.to_string()));
                        }
                        Ok(Some(Ok(event))) => event,
                    }
                }
            };

            if event.event == "message_stop" {
                break;
            }
            if event.data.trim().is_empty() {
                continue;
            }

            match event.event.as_str() {
                "message_start" => {
                    if let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) {
                        usage.input_tokens = start.message.usage.input_tokens;
                    }
                }
                "content_block_start" => {
                    if let Ok(start) = serde_json::from_str::<ContentBlockStart>(&event.data) {
                        if let AnthropicContentBlock::ToolUse { id, name, input } =
                            start.content_block
                        {
                            // Providers may seed the block with a partial or
                            // empty object; streaming deltas replace it
                            let seed = if input.is_null()
                                || input == serde_json::json!({})
                            {
                                String::new()
                            } else {
                                input.to_string()
                            };
                            on_chunk(StreamChunk::ToolCallDelta {
                                index: tool_calls.len(),
                                id: Some(id.clone()),
                                name: Some(name.clone()),
                                arguments_delta: None,
                            });
                            open_tool = Some((start.index, id, name, seed));
                        }
                    }
                }
                "content_block_delta" => {
                    if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&event.data) {
                        match delta.delta {
                            ContentDelta::TextDelta { text } => {
                                content.push_str(&text);
                                on_chunk(StreamChunk::Content(text));
                            }
                            ContentDelta::InputJsonDelta { partial_json } => {
                                if let Some((_, _, _, ref mut json)) = open_tool {
                                    json.push_str(&partial_json);
                                    on_chunk(StreamChunk::ToolCallDelta {
                                        index: tool_calls.len(),
                                        id: None,
                                        name: None,
                                        arguments_delta: Some(partial_json),
                                    });
                                }
                            }
                            ContentDelta::ThinkingDelta { .. } => {}
                        }
                    }
                }
                "content_block_stop" => {
                    // Parse the accumulated fragments exactly once
                    if let Some((_, id, name, json)) = open_tool.take() {
                        let arguments = if json.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            json
                        };
                        // Reject unparseable input here rather than shipping
                        // broken JSON to the executor
                        if serde_json::from_str::<serde_json::Value>(&arguments).is_err() {
                            log::warn!("discarding tool call {} with invalid input JSON", id);
                        } else {
                            tool_calls.push(ToolCall { id, name, arguments });
                        }
                    }
                }
                "message_delta" => {
                    if let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) {
                        if let Some(u) = delta.usage {
                            usage.output_tokens = u.output_tokens;
                        }
                    }
                }
                _ => {}
            }
        }

        let mut message = Message::assistant(content);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls.clone());
        }

        Ok(AdapterResponse {
            message,
            tool_calls,
            usage,
            tools_skipped: None,
        })
    }

    /// All results of one turn travel in a single user message whose content
    /// is an array of tool_result blocks
    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
        let parts: Vec<ContentPart> = results
            .iter()
            .map(|r| ContentPart::ToolResult {
                id: r.tool_call_id.clone(),
                content: r.content.clone(),
            })
            .collect();

        vec![Message {
            role: Role::User,
            content: String::new(),
            parts: Some(parts),
            tool_call_id: None,
            tool_calls: None,
        }]
    }
}

// ============================================================================
// Message translation
// ============================================================================

fn build_anthropic_messages(
    messages: &[Message],
    images: &[ImagePayload],
) -> (Vec<AnthropicMessage>, Option<String>) {
    let mut wire = Vec::new();
    let mut system: Option<String> = None;
    let last_user = messages.iter().rposition(|m| m.role == Role::User);

    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::System => {
                if system.is_none() {
                    system = Some(msg.text());
                }
            }
            Role::User => {
                let mut blocks = user_blocks(msg);
                if Some(idx) == last_user {
                    for image in images {
                        blocks.push(AnthropicContentBlock::Image {
                            source: ImageSource {
                                source_type: "base64".to_string(),
                                media_type: image.media_type.clone(),
                                data: image.data.clone(),
                            },
                        });
                    }
                }
                if blocks.len() == 1 {
                    if let AnthropicContentBlock::Text { text } = &blocks[0] {
                        wire.push(AnthropicMessage {
                            role: "user".to_string(),
                            content: AnthropicContent::Text(text.clone()),
                        });
                        continue;
                    }
                }
                wire.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: AnthropicContent::Blocks(blocks),
                });
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        let input = call
                            .parsed_arguments()
                            .unwrap_or_else(|_| serde_json::json!({}));
                        blocks.push(AnthropicContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input,
                        });
                    }
                }
                if !blocks.is_empty() {
                    wire.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: AnthropicContent::Blocks(blocks),
                    });
                }
            }
            Role::Tool => {
                // Bare tool messages (from other adapters' formatting) still
                // become tool_result blocks in a user message
                if let Some(id) = &msg.tool_call_id {
                    wire.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: AnthropicContent::Blocks(vec![
                            AnthropicContentBlock::ToolResult {
                                tool_use_id: id.clone(),
                                content: msg.content.clone(),
                                is_error: None,
                            },
                        ]),
                    });
                }
            }
        }
    }

    (wire, system)
}

fn user_blocks(msg: &Message) -> Vec<AnthropicContentBlock> {
    match &msg.parts {
        None => vec![AnthropicContentBlock::Text {
            text: msg.content.clone(),
        }],
        Some(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(AnthropicContentBlock::Text {
                    text: text.clone(),
                }),
                ContentPart::Image { media_type, data } => Some(AnthropicContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                }),
                ContentPart::ToolResult { id, content } => {
                    Some(AnthropicContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: content.clone(),
                        is_error: None,
                    })
                }
                _ => None,
            })
            .collect(),
    }
}

fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.name.clone(),
            description: Some(tool.description.clone()),
            input_schema: tool.parameters.clone(),
        })
        .collect()
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize, Clone)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// Streaming event types
#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartContent,
}

#[derive(Debug, Deserialize)]
struct MessageStartContent {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    #[allow(dead_code)]
    index: usize,
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    usage: Option<AnthropicUsageDelta>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsageDelta {
    output_tokens: u32,
}
