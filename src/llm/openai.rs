// OpenAI-compatible adapter using reqwest + SSE streaming.
// Also serves custom OpenAI-compatible endpoints (any base URL) and lends
// its wire types to the Cerebras adapter, which speaks the same transport.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ProviderError;
use super::provider::*;

pub(crate) const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// How long a stream may stay silent before the call is abandoned
pub(crate) const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Models allowed to receive image parts; others drop images with a warning
const VISION_MODELS: [&str; 5] = ["gpt-4o", "gpt-4.1", "gpt-5", "o3", "chatgpt-4o"];

#[derive(Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    provider_id: String,
}

impl OpenAiAdapter {
    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        Self::with_endpoint("openai", OPENAI_API_BASE, model, api_key)
    }

    /// Adapter bound to a custom OpenAI-compatible endpoint
    pub fn with_endpoint(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        model: String,
        api_key: String,
    ) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config(
                "OpenAI API key must not be empty".to_string(),
            ));
        }
        if model.trim().is_empty() {
            return Err(ProviderError::Config("model must not be empty".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_id: provider_id.into(),
        })
    }

    fn supports_vision(model: &str) -> bool {
        VISION_MODELS.iter().any(|m| model.starts_with(m))
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
        stream: bool,
    ) -> ChatCompletionRequest {
        let vision = Self::supports_vision(&self.model);
        if !ctx.images.is_empty() && !vision {
            log::warn!(
                "model {} is not on the vision allow-list; dropping {} image(s)",
                self.model,
                ctx.images.len()
            );
        }

        let chat_messages = build_chat_messages(messages, &ctx.images, vision);

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: chat_messages,
            temperature: None,
            max_completion_tokens: Some(self.max_output_tokens()),
            stream,
            stream_options: if stream {
                Some(StreamOptions {
                    include_usage: true,
                })
            } else {
                None
            },
            tools: if tools.is_empty() {
                None
            } else {
                Some(convert_tools(tools))
            },
            parallel_tool_calls: if tools.is_empty() { None } else { Some(true) },
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_output_tokens(&self) -> u32 {
        16_384
    }

    async fn call(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx, false);
        execute_completion(&self.client, &self.base_url, &self.api_key, &request, ctx).await
    }

    async fn call_stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx, true);
        execute_streaming(&self.client, &self.base_url, &self.api_key, &request, on_chunk, ctx)
            .await
    }

    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
        results
            .iter()
            .map(|r| Message::tool(r.tool_call_id.clone(), r.content.clone()))
            .collect()
    }
}

// ============================================================================
// Shared transport (also driven by the Cerebras adapter)
// ============================================================================

pub(crate) async fn execute_completion(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    request: &ChatCompletionRequest,
    ctx: &CallContext,
) -> Result<AdapterResponse, ProviderError> {
    let send = client
        .post(format!("{}/chat/completions", base_url))
        .bearer_auth(api_key)
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

    let completion: ChatCompletionResponse = response.json().await?;
    let usage = completion
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Stream("response carried no choices".to_string()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    let content = choice.message.content.unwrap_or_default();
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

pub(crate) async fn execute_streaming(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    request: &ChatCompletionRequest,
    on_chunk: ChunkSink<'_>,
    ctx: &CallContext,
) -> Result<AdapterResponse, ProviderError> {
    let send = client
        .post(format!("{}/chat/completions", base_url))
        .bearer_auth(api_key)
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

    let event_stream = response.bytes_stream().eventsource();
    futures::pin_mut!(event_stream);

    let mut content = String::new();
    let mut assembler = ToolCallAssembler::new();
    let mut usage = TokenUsage::default();

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

        if event.data.trim() == "[DONE]" {
            break;
        }
        if event.data.trim().is_empty() {
            continue;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!("skipping unparseable completion chunk: {}", err);
                continue;
            }
        };

        if let Some(u) = chunk.usage {
            usage.input_tokens = u.prompt_tokens;
            usage.output_tokens = u.completion_tokens;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                content.push_str(&text);
                on_chunk(StreamChunk::Content(text));
            }
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match &delta.function {
                Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
                None => (None, None),
            };
            assembler.process_delta(delta.index, delta.id.as_deref(), name, arguments);
            on_chunk(StreamChunk::ToolCallDelta {
                index: delta.index,
                id: delta.id.clone(),
                name: name.map(|s| s.to_string()),
                arguments_delta: arguments.map(|s| s.to_string()),
            });
        }
    }

    let tool_calls = assembler.into_tool_calls();
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

/// Translate shared messages to the chat-completions shape. When `vision`
/// holds and images are attached, the last user message becomes a parts
/// array carrying data-URI image entries.
pub(crate) fn build_chat_messages(
    messages: &[Message],
    images: &[ImagePayload],
    vision: bool,
) -> Vec<ChatMessage> {
    let last_user = messages
        .iter()
        .rposition(|m| m.role == Role::User);

    messages
        .iter()
        .enumerate()
        .map(|(idx, msg)| {
            let inject = vision && !images.is_empty() && Some(idx) == last_user;
            convert_message(msg, if inject { images } else { &[] })
        })
        .collect()
}

fn convert_message(msg: &Message, images: &[ImagePayload]) -> ChatMessage {
    match msg.role {
        Role::System => ChatMessage::System {
            content: msg.text(),
        },
        Role::User => {
            if images.is_empty() {
                ChatMessage::User {
                    content: UserContent::Text(msg.text()),
                }
            } else {
                let mut parts = vec![OpenAiContentPart::Text { text: msg.text() }];
                for image in images {
                    parts.push(OpenAiContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{};base64,{}", image.media_type, image.data),
                        },
                    });
                }
                ChatMessage::User {
                    content: UserContent::Parts(parts),
                }
            }
        }
        Role::Assistant => {
            let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| OpenAiToolCall {
                        id: tc.id.clone(),
                        tool_type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect()
            });

            ChatMessage::Assistant {
                content: if msg.content.is_empty() && tool_calls.is_some() {
                    None
                } else {
                    Some(msg.text())
                },
                tool_calls,
            }
        }
        Role::Tool => ChatMessage::Tool {
            content: msg.text(),
            tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
        },
    }
}

pub(crate) fn convert_tools(tools: &[Tool]) -> Vec<OpenAiTool> {
    tools
        .iter()
        .map(|t| OpenAiTool {
            tool_type: "function".to_string(),
            function: OpenAiFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    /// Never set for Cerebras, which rejects the key outright
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
pub(crate) struct OpenAiTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAiFunction,
}

#[derive(Debug, Serialize, Clone)]
pub(crate) struct OpenAiFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role", rename_all = "lowercase")]
pub(crate) enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum UserContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkChoice {
    pub delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkToolCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ChunkFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}
