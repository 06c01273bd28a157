// Gemini adapter using reqwest + SSE streaming.
// Roles remap (assistant -> model, tool results -> user functionResponse
// parts keyed by tool *name*), the system prompt moves to systemInstruction,
// schemas are sanitized for Gemini's JSON-Schema subset, and thinking models
// round-trip an opaque thought signature on every text part.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::error::ProviderError;
use super::openai::STREAM_IDLE_TIMEOUT;
use super::provider::*;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Signature and declared name remembered for each synthesized call id
#[derive(Debug, Clone)]
struct ToolCallMeta {
    signature: Option<String>,
    function_name: String,
}

#[derive(Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    tool_call_meta: Arc<RwLock<HashMap<String, ToolCallMeta>>>,
    call_counter: Arc<AtomicU64>,
}

impl GeminiAdapter {
    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config(
                "Gemini API key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            tool_call_meta: Arc::new(RwLock::new(HashMap::new())),
            call_counter: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Models that emit (and then require) thought signatures
    fn is_thinking_model(model: &str) -> bool {
        model.contains("thinking") || model.contains("gemini-2.5") || model.contains("gemini-3")
    }

    fn next_call_id(&self) -> String {
        let idx = self.call_counter.fetch_add(1, Ordering::SeqCst);
        format!("gemini_call_{}", idx)
    }

    fn register_tool_call(&self, call_id: String, meta: ToolCallMeta) {
        if let Ok(mut map) = self.tool_call_meta.write() {
            map.insert(call_id, meta);
        }
    }

    fn tool_meta(&self, call_id: &str) -> Option<ToolCallMeta> {
        self.tool_call_meta
            .read()
            .ok()
            .and_then(|m| m.get(call_id).cloned())
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[Tool],
        ctx: &CallContext,
    ) -> GenerateContentRequest {
        let (contents, system_instruction) = self.build_contents(messages, &ctx.images);

        let gemini_tools = if tools.is_empty() {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|tool| GeminiFunctionDeclaration {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: sanitize_schema(&tool.parameters),
                    })
                    .collect(),
            }])
        };

        let tool_config = gemini_tools.as_ref().map(|_| GeminiToolConfig {
            function_calling_config: GeminiFunctionCallingConfig {
                mode: "AUTO".to_string(),
            },
        });

        GenerateContentRequest {
            contents,
            tools: gemini_tools,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(self.max_output_tokens()),
            }),
            tool_config,
        }
    }

    fn build_contents(
        &self,
        messages: &[Message],
        images: &[ImagePayload],
    ) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let mut contents = Vec::new();
        let mut system_instruction: Option<GeminiContent> = None;
        let last_user = messages.iter().rposition(|m| m.role == Role::User);
        let thinking = Self::is_thinking_model(&self.model);

        for (idx, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::System => {
                    if system_instruction.is_none() {
                        system_instruction = Some(GeminiContent {
                            role: None,
                            parts: vec![GeminiPart {
                                text: Some(msg.text()),
                                ..Default::default()
                            }],
                        });
                    }
                }
                Role::User => {
                    let mut parts = vec![GeminiPart {
                        text: Some(msg.text()),
                        ..Default::default()
                    }];
                    if Some(idx) == last_user {
                        for image in images {
                            parts.push(GeminiPart {
                                inline_data: Some(GeminiInlineData {
                                    mime_type: image.media_type.clone(),
                                    data: image.data.clone(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts,
                    });
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    let signature = if thinking {
                        message_signature(msg)
                    } else {
                        None
                    };

                    if !msg.content.is_empty() {
                        parts.push(GeminiPart {
                            text: Some(msg.content.clone()),
                            thought_signature: signature.clone(),
                            ..Default::default()
                        });
                    }

                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            let call_signature = self
                                .tool_meta(&call.id)
                                .and_then(|meta| meta.signature)
                                .or_else(|| signature.clone());
                            parts.push(GeminiPart {
                                thought_signature: call_signature,
                                function_call: Some(GeminiFunctionCall {
                                    name: call.name.clone(),
                                    args: call
                                        .parsed_arguments()
                                        .unwrap_or_else(|_| serde_json::json!({})),
                                }),
                                ..Default::default()
                            });
                        }
                    }

                    if !parts.is_empty() {
                        contents.push(GeminiContent {
                            role: Some("model".to_string()),
                            parts,
                        });
                    }
                }
                Role::Tool => {
                    if let Some(call_id) = &msg.tool_call_id {
                        let name = self
                            .tool_meta(call_id)
                            .map(|meta| meta.function_name)
                            .unwrap_or_else(|| "tool".to_string());
                        contents.push(GeminiContent {
                            role: Some("user".to_string()),
                            parts: vec![GeminiPart {
                                function_response: Some(GeminiFunctionResponse {
                                    name,
                                    response: parse_tool_response_json(&msg.content),
                                }),
                                ..Default::default()
                            }],
                        });
                    } else if let Some(parts) = &msg.parts {
                        // A batch of results formatted by format_tool_results
                        let mut fn_parts = Vec::new();
                        for part in parts {
                            if let ContentPart::ToolResult { id, content } = part {
                                let name = self
                                    .tool_meta(id)
                                    .map(|meta| meta.function_name)
                                    .unwrap_or_else(|| "tool".to_string());
                                fn_parts.push(GeminiPart {
                                    function_response: Some(GeminiFunctionResponse {
                                        name,
                                        response: parse_tool_response_json(content),
                                    }),
                                    ..Default::default()
                                });
                            }
                        }
                        if !fn_parts.is_empty() {
                            contents.push(GeminiContent {
                                role: Some("user".to_string()),
                                parts: fn_parts,
                            });
                        }
                    }
                }
            }
        }

        (contents, system_instruction)
    }

    fn absorb_parts(
        &self,
        parts: Vec<GeminiPart>,
        content: &mut String,
        tool_calls: &mut Vec<ToolCall>,
        signature: &mut Option<String>,
        on_chunk: ChunkSink<'_>,
    ) {
        for part in parts {
            if let Some(sig) = &part.thought_signature {
                *signature = Some(sig.clone());
            }

            if let Some(text) = part.text {
                if !text.is_empty() {
                    content.push_str(&text);
                    on_chunk(StreamChunk::Content(text));
                }
            }

            if let Some(function_call) = part.function_call {
                let call_id = self.next_call_id();
                self.register_tool_call(
                    call_id.clone(),
                    ToolCallMeta {
                        signature: part.thought_signature.clone(),
                        function_name: function_call.name.clone(),
                    },
                );

                let arguments = function_call.args.to_string();
                on_chunk(StreamChunk::ToolCallDelta {
                    index: tool_calls.len(),
                    id: Some(call_id.clone()),
                    name: Some(function_call.name.clone()),
                    arguments_delta: Some(arguments.clone()),
                });
                tool_calls.push(ToolCall {
                    id: call_id,
                    name: function_call.name,
                    arguments,
                });
            }
        }
    }

    fn finish_response(
        &self,
        content: String,
        tool_calls: Vec<ToolCall>,
        signature: Option<String>,
        usage: TokenUsage,
    ) -> AdapterResponse {
        let mut message = Message::assistant(content.clone());
        if Self::is_thinking_model(&self.model) {
            if let Some(signature) = signature {
                message.parts = Some(vec![
                    ContentPart::Text { text: content },
                    ContentPart::ThoughtSignature { signature },
                ]);
            }
        }
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls.clone());
        }

        AdapterResponse {
            message,
            tool_calls,
            usage,
            tools_skipped: None,
        }
    }
}

/// Signature previously attached to this assistant message, if any
fn message_signature(msg: &Message) -> Option<String> {
    msg.parts.as_ref().and_then(|parts| {
        parts.iter().find_map(|part| match part {
            ContentPart::ThoughtSignature { signature } => Some(signature.clone()),
            _ => None,
        })
    })
}

fn parse_tool_response_json(payload: &str) -> serde_json::Value {
    serde_json::from_str(payload).unwrap_or_else(|_| {
        serde_json::json!({
            "result": payload
        })
    })
}

/// Gemini rejects `enum` on non-string types; strip it recursively from
/// object properties and array items.
pub(crate) fn sanitize_schema(schema: &serde_json::Value) -> serde_json::Value {
    let mut sanitized = schema.clone();
    sanitize_in_place(&mut sanitized);
    sanitized
}

fn sanitize_in_place(value: &mut serde_json::Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    let is_string_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t == "string")
        .unwrap_or(false);
    if !is_string_type {
        obj.remove("enum");
    }

    if let Some(props) = obj.get_mut("properties").and_then(|p| p.as_object_mut()) {
        for (_, prop) in props.iter_mut() {
            sanitize_in_place(prop);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        sanitize_in_place(items);
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider_id(&self) -> &str {
        "gemini"
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
        let request = self.build_request(messages, tools, ctx);

        let send = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                GEMINI_API_BASE, self.model
            ))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
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

        let completed: GenerateContentResponse = response.json().await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut signature = None;
        let mut usage = TokenUsage::default();

        if let Some(meta) = &completed.usage_metadata {
            usage.input_tokens = meta.prompt_token_count.unwrap_or(0);
            usage.output_tokens = meta.candidates_token_count.unwrap_or(0);
        }

        if let Some(candidate) = completed.candidates.unwrap_or_default().into_iter().next() {
            if let Some(candidate_content) = candidate.content {
                self.absorb_parts(
                    candidate_content.parts,
                    &mut content,
                    &mut tool_calls,
                    &mut signature,
                    null_sink(),
                );
            }
        }

        Ok(self.finish_response(content, tool_calls, signature, usage))
    }

    async fn call_stream(
        &self,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> Result<AdapterResponse, ProviderError> {
        let request = self.build_request(messages, tools, ctx);

        let send = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                GEMINI_API_BASE, self.model
            ))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
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
        let mut tool_calls = Vec::new();
        let mut signature = None;
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

            if event.data.trim().is_empty() || event.data == "[DONE]" {
                continue;
            }

            let chunk: GenerateContentResponse = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    return Err(ProviderError::Stream(format!(
                        "failed to parse Gemini chunk: {}",
                        err
                    )));
                }
            };

            if let Some(meta) = &chunk.usage_metadata {
                usage.input_tokens = meta.prompt_token_count.unwrap_or(0);
                usage.output_tokens = meta.candidates_token_count.unwrap_or(0);
            }

            if let Some(candidate) = chunk.candidates.unwrap_or_default().into_iter().next() {
                if let Some(candidate_content) = candidate.content {
                    self.absorb_parts(
                        candidate_content.parts,
                        &mut content,
                        &mut tool_calls,
                        &mut signature,
                        on_chunk,
                    );
                }
            }
        }

        Ok(self.finish_response(content, tool_calls, signature, usage))
    }

    /// Tool results become functionResponse parts in a single user message,
    /// keyed by the declared function *name* rather than the call id
    fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
        // Make sure the name survives even if the meta map was cleared
        for result in results {
            if self.tool_meta(&result.tool_call_id).is_none() {
                self.register_tool_call(
                    result.tool_call_id.clone(),
                    ToolCallMeta {
                        signature: None,
                        function_name: result.tool_name.clone(),
                    },
                );
            }
        }

        let parts: Vec<ContentPart> = results
            .iter()
            .map(|r| ContentPart::ToolResult {
                id: r.tool_call_id.clone(),
                content: r.content.clone(),
            })
            .collect();

        vec![Message {
            role: Role::Tool,
            content: String::new(),
            parts: Some(parts),
            tool_call_id: None,
            tool_calls: None,
        }]
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "thoughtSignature", skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GeminiToolConfig {
    #[serde(rename = "functionCallingConfig")]
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(model: &str) -> GeminiAdapter {
        GeminiAdapter::new(model.to_string(), "key".to_string()).unwrap()
    }

    #[test]
    fn strips_enum_from_non_string_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "n": { "type": "integer", "enum": [1, 2, 3] },
                "mode": { "type": "string", "enum": ["fast", "deep"] },
                "nested": {
                    "type": "object",
                    "properties": {
                        "level": { "type": "number", "enum": [0.5, 1.0] }
                    }
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "integer", "enum": [1, 2] }
                }
            }
        });

        let sanitized = sanitize_schema(&schema);
        assert!(sanitized["properties"]["n"].get("enum").is_none());
        assert_eq!(
            sanitized["properties"]["mode"]["enum"],
            json!(["fast", "deep"])
        );
        assert!(sanitized["properties"]["nested"]["properties"]["level"]
            .get("enum")
            .is_none());
        assert!(sanitized["properties"]["tags"]["items"].get("enum").is_none());

        // The original is untouched for other providers
        assert_eq!(schema["properties"]["n"]["enum"], json!([1, 2, 3]));
    }

    #[test]
    fn roles_remap_and_system_moves_to_instruction() {
        let a = adapter("gemini-2.0-flash");
        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let (contents, system) = a.build_contents(&messages, &[]);

        assert!(system.is_some());
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn tool_results_use_function_name_not_call_id() {
        let a = adapter("gemini-2.0-flash");
        let results = vec![ToolResult {
            tool_call_id: "gemini_call_7".to_string(),
            tool_name: "get_weather".to_string(),
            content: r#"{"temp": 21}"#.to_string(),
            is_error: false,
        }];

        let formatted = a.format_tool_results(&results);
        let (contents, _) = a.build_contents(&formatted, &[]);

        let json = serde_json::to_value(&contents).unwrap();
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(
            json[0]["parts"][0]["functionResponse"]["response"]["temp"],
            21
        );
        assert!(json.to_string().find("gemini_call_7").is_none());
    }

    #[test]
    fn thought_signature_round_trips_for_thinking_models() {
        let a = adapter("gemini-3-flash-preview");
        let response = a.finish_response(
            "thinking done".to_string(),
            Vec::new(),
            Some("sig_abc".to_string()),
            TokenUsage::default(),
        );

        // Signature is preserved on the assistant message
        assert!(message_signature(&response.message).is_some());

        // And re-attached when the message goes back out
        let (contents, _) = a.build_contents(&[response.message], &[]);
        let json = serde_json::to_value(&contents).unwrap();
        assert_eq!(json[0]["parts"][0]["thoughtSignature"], "sig_abc");
    }

    #[test]
    fn non_thinking_models_skip_signatures() {
        let a = adapter("gemini-1.5-flash");
        let response = a.finish_response(
            "plain".to_string(),
            Vec::new(),
            Some("sig_abc".to_string()),
            TokenUsage::default(),
        );
        assert!(response.message.parts.is_none());
    }

    #[test]
    fn non_json_tool_output_is_wrapped() {
        assert_eq!(
            parse_tool_response_json("plain text"),
            json!({"result": "plain text"})
        );
        assert_eq!(parse_tool_response_json(r#"{"a":1}"#), json!({"a": 1}));
    }
}
