// Cerebras adapter. Speaks the OpenAI chat-completions wire format with
// provider-specific exceptions: `parallel_tool_calls` is never sent,
// streaming with tools only works for an allow-list of models (others fall
// back to non-streaming and synthesize chunks), and HTTP 422 with tools
// triggers one retry with tools omitted.

use super::error::ProviderError;
use super::openai::{
    build_chat_messages, convert_tools, execute_completion, execute_streaming,
    ChatCompletionRequest, StreamOptions,
};
use super::provider::*;

const CEREBRAS_API_BASE: &str = "https://api.cerebras.ai/v1";

/// Models that support streaming and tool calls at the same time
const STREAM_TOOL_MODELS: [&str; 3] = ["llama-3.3-70b", "llama3.1-8b", "qwen-3-32b"];

#[derive(Clone)]
pub struct CerebrasAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl CerebrasAdapter {
    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config(
                "Cerebras API key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        })
    }

    fn supports_streaming_tools(model: &str) -> bool {
        STREAM_TOOL_MODELS.iter().any(|m| model.starts_with(m))
    }

    /// Like the OpenAI request builder but `parallel_tool_calls` stays unset;
    /// Cerebras rejects any request carrying the key.
    fn build_request(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
        stream: bool,
    ) -> ChatCompletionRequest {
        if !ctx.images.is_empty() {
            log::warn!("Cerebras models do not accept images; dropping {}", ctx.images.len());
        }

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: build_chat_messages(messages, &[], false),
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
            parallel_tool_calls: None,
        }
    }

    /// Run the non-streaming call, retrying once without tools on 422
    async fn call_with_tool_fallback(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx, false);
        let result =
            execute_completion(&self.client, CEREBRAS_API_BASE, &self.api_key, &request, ctx).await;

        match result {
            Err(ProviderError::Api { status: 422, body }) if !tools.is_empty() => {
                log::warn!("Cerebras rejected tools with 422; retrying without tools");
                let bare = self.build_request(messages, &[], ctx, false);
                let mut response =
                    execute_completion(&self.client, CEREBRAS_API_BASE, &self.api_key, &bare, ctx)
                        .await?;
                response.tools_skipped = Some(format!(
                    "model rejected the tool definitions (HTTP 422): {}",
                    super::error::unwrap_error_body(&body)
                ));
                Ok(response)
            }
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for CerebrasAdapter {
    fn provider_id(&self) -> &str {
        "cerebras"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_output_tokens(&self) -> u32 {
        8_192
    }

    async fn call(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        self.call_with_tool_fallback(messages, tools, ctx).await
    }

    async fn call_stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        if !tools.is_empty() && !Self::supports_streaming_tools(&self.model) {
            // Transparent fallback: run non-streaming, then synthesize the
            // chunks a streaming consumer expects
            let response = self.call_with_tool_fallback(messages, tools, ctx).await?;

            if !response.message.content.is_empty() {
                on_chunk(StreamChunk::Content(response.message.content.clone()));
            }
            for (index, call) in response.tool_calls.iter().enumerate() {
                on_chunk(StreamChunk::ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments_delta: Some(call.arguments.clone()),
                });
            }
            return Ok(response);
        }

        let request = self.build_request(messages, tools, ctx, true);
        execute_streaming(
            &self.client,
            CEREBRAS_API_BASE,
            &self.api_key,
            &request,
            on_chunk,
            ctx,
        )
        .await
    }

    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
        results
            .iter()
            .map(|r| Message::tool(r.tool_call_id.clone(), r.content.clone()))
            .collect()
    }
}
