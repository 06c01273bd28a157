// OpenAI Responses API adapter, used for GPT-5 and o-series models.
// Conversation history is re-shaped into `input` items (messages,
// function_call, function_call_output), the system prompt becomes
// `instructions`, and reasoning-capable models get a medium effort hint.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::openai::{OPENAI_API_BASE, STREAM_IDLE_TIMEOUT};
use super::provider::*;

#[derive(Clone)]
pub struct ResponsesAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ResponsesAdapter {
    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config(
                "OpenAI API key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        })
    }

    /// Whether `model` should be served through the Responses API
    pub fn handles_model(model: &str) -> bool {
        if model.starts_with("gpt-5") {
            return true;
        }
        // o-series: "o1", "o3-mini", "o4-mini-high", ...
        let mut chars = model.chars();
        matches!(
            (chars.next(), chars.next()),
            (Some('o'), Some(c)) if c.is_ascii_digit()
        )
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[Tool],
        stream: bool,
    ) -> ResponsesRequest {
        let (input, instructions) = build_input_items(messages);

        ResponsesRequest {
            model: self.model.clone(),
            input,
            instructions,
            stream: if stream { Some(true) } else { None },
            max_output_tokens: Some(self.max_output_tokens()),
            reasoning: Some(ReasoningOptions {
                effort: "medium".to_string(),
            }),
            tools: if tools.is_empty() {
                None
            } else {
                Some(
                    tools
                        .iter()
                        .map(|t| ResponsesTool {
                            tool_type: "function".to_string(),
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: t.parameters.clone(),
                        })
                        .collect(),
                )
            },
        }
    }

    async fn send(
        &self,
        request: &ResponsesRequest,
        ctx: &CallContext,
    ) -> Result<reqwest::Response, ProviderError> {
        let send = self
            .client
            .post(format!("{}/responses", OPENAI_API_BASE))
            .bearer_auth(&self.api_key)
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
impl ProviderAdapter for ResponsesAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_output_tokens(&self) -> u32 {
        32_768
    }

    async fn call(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, false);
        let response = self.send(&request, ctx).await?;
        let completed: ResponsesResponse = response.json().await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for item in completed.output {
            match item {
                OutputItem::Message { content: parts, .. } => {
                    for part in parts {
                        if let OutputContentPart::OutputText { text } = part {
                            content.push_str(&text);
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    tool_calls.push(ToolCall {
                        id: call_id,
                        name,
                        arguments,
                    });
                }
                OutputItem::Other => {}
            }
        }

        let usage = completed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

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
        let request = self.build_request(messages, tools, true);
        let response = self.send(&request, ctx).await?;

        let event_stream = response.bytes_stream().eventsource();
        futures::pin_mut!(event_stream);

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = TokenUsage::default();
        // (call_id, name, argument accumulator) of the item being streamed
        let mut open_call: Option<(String, String, String)> = None;

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

            if event.data.trim().is_empty() {
                continue;
            }

            let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            match parsed {
                StreamEvent::OutputItemAdded { item } => {
                    if let OutputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                    } = item
                    {
                        on_chunk(StreamChunk::ToolCallDelta {
                            index: tool_calls.len(),
                            id: Some(call_id.clone()),
                            name: Some(name.clone()),
                            arguments_delta: None,
                        });
                        open_call = Some((call_id, name, arguments));
                    }
                }
                StreamEvent::OutputTextDelta { delta } => {
                    if !delta.is_empty() {
                        content.push_str(&delta);
                        on_chunk(StreamChunk::Content(delta));
                    }
                }
                StreamEvent::FunctionCallArgumentsDelta { delta } => {
                    if let Some((_, _, ref mut arguments)) = open_call {
                        arguments.push_str(&delta);
                        on_chunk(StreamChunk::ToolCallDelta {
                            index: tool_calls.len(),
                            id: None,
                            name: None,
                            arguments_delta: Some(delta),
                        });
                    }
                }
                StreamEvent::FunctionCallArgumentsDone { arguments } => {
                    if let Some((call_id, name, accumulated)) = open_call.take() {
                        // The done event carries the authoritative arguments
                        let final_arguments = if arguments.is_empty() {
                            accumulated
                        } else {
                            arguments
                        };
                        tool_calls.push(ToolCall {
                            id: call_id,
                            name,
                            arguments: final_arguments,
                        });
                    }
                }
                StreamEvent::Completed { response } => {
                    if let Some(u) = response.usage {
                        usage.input_tokens = u.input_tokens;
                        usage.output_tokens = u.output_tokens;
                    }
                }
                StreamEvent::Other => {}
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

    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
        results
            .iter()
            .map(|r| Message::tool(r.tool_call_id.clone(), r.content.clone()))
            .collect()
    }
}

// ============================================================================
// Input translation
// ============================================================================

/// Re-shape conversation history into Responses `input` items plus the
/// lifted `instructions` string
fn build_input_items(messages: &[Message]) -> (Vec<InputItem>, Option<String>) {
    let mut input = Vec::new();
    let mut instructions: Option<String> = None;

    for msg in messages {
        match msg.role {
            Role::System => {
                if instructions.is_none() {
                    instructions = Some(msg.text());
                }
            }
            Role::User => {
                input.push(InputItem::Message {
                    role: "user".to_string(),
                    content: vec![InputContentPart::InputText { text: msg.text() }],
                });
            }
            Role::Assistant => {
                if !msg.content.is_empty() {
                    input.push(InputItem::Message {
                        role: "assistant".to_string(),
                        content: vec![InputContentPart::OutputText {
                            text: msg.content.clone(),
                        }],
                    });
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        input.push(InputItem::FunctionCall {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        });
                    }
                }
            }
            Role::Tool => {
                if let Some(id) = &msg.tool_call_id {
                    input.push(InputItem::FunctionCallOutput {
                        call_id: id.clone(),
                        output: msg.content.clone(),
                    });
                }
            }
        }
    }

    (input, instructions)
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool>>,
}

#[derive(Debug, Serialize)]
struct ReasoningOptions {
    effort: String,
}

#[derive(Debug, Serialize)]
struct ResponsesTool {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: String,
        content: Vec<InputContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputContentPart {
    InputText { text: String },
    OutputText { text: String },
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContentPart {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Streaming event taxonomy
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "response.completed")]
    Completed { response: CompletedResponse },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CompletedResponse {
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}
