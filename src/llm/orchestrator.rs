// Conversation turn loop.
// Runs the adapter, executes any validated tool calls through the
// caller-supplied executor, formats results back into provider shape and
// re-enters, bounded by a per-turn cap. Tool execution errors become tool
// messages; the model decides whether to retry or surface them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::provider::*;
use super::retry::RetryEngine;

/// Tool executor function type.
///
/// Takes a ToolCall and resolves to Ok(output) or Err(error text). Treated
/// as an opaque suspension point and bounded by the per-call timeout.
pub type ToolExecutor = Arc<
    dyn Fn(ToolCall) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        + Send
        + Sync,
>;

/// Build a ToolExecutor from an async closure
pub fn executor_fn<F, Fut>(f: F) -> ToolExecutor
where
    F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

#[derive(Clone)]
pub struct TurnOptions {
    /// Model call + tool execution rounds before tools are disabled
    pub max_tool_turns: usize,
    /// Per-tool-call execution budget
    pub tool_timeout: Duration,
    /// Prefer call_stream over call
    pub streaming: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            max_tool_turns: 8,
            tool_timeout: Duration::from_secs(60),
            streaming: true,
        }
    }
}

/// Everything produced by one user turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text
    pub final_text: String,
    /// Messages appended during the turn, in order (assistant messages,
    /// formatted tool results, final assistant reply)
    pub appended: Vec<Message>,
    /// Every tool call executed across the turn
    pub all_tool_calls: Vec<ToolCall>,
    pub recovered: bool,
    pub recovered_error: Option<String>,
    pub usage: TokenUsage,
}

pub struct Orchestrator {
    options: TurnOptions,
}

impl Orchestrator {
    pub fn new(options: TurnOptions) -> Self {
        Self { options }
    }

    /// Drive one user turn to completion.
    ///
    /// `history` must already contain the user's message. The caller owns
    /// persistence; nothing here mutates shared state, so a cancelled turn
    /// leaves no side effects beyond the outcome it returns.
    pub async fn run_turn(
        &self,
        adapter: &dyn ProviderAdapter,
        history: &[Message],
        tools: &[Tool],
        executor: &ToolExecutor,
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
    ) -> TurnOutcome {
        let engine = RetryEngine::for_adapter(adapter);
        let mut working = history.to_vec();
        let mut appended = Vec::new();
        let mut all_tool_calls = Vec::new();
        let mut usage = TokenUsage::default();

        let effective_tools = if adapter.supports_tools() { tools } else { &[] };
        let mut rounds = 0usize;

        loop {
            let tools_this_round = if rounds >= self.options.max_tool_turns {
                // Cap reached: one final call with tools disabled
                log::warn!(
                    "tool turn cap ({}) reached; finishing without tools",
                    self.options.max_tool_turns
                );
                &[]
            } else {
                effective_tools
            };

            let result = engine
                .execute(
                    adapter,
                    &working,
                    tools_this_round,
                    on_chunk,
                    ctx,
                    self.options.streaming,
                )
                .await;
            usage.add(&result.usage);

            if result.recovered {
                appended.push(result.message.clone());
                return TurnOutcome {
                    final_text: result.message.content,
                    appended,
                    all_tool_calls,
                    recovered: true,
                    recovered_error: result.recovered_error,
                    usage,
                };
            }

            if result.tool_calls.is_empty() {
                appended.push(result.message.clone());
                return TurnOutcome {
                    final_text: result.message.content,
                    appended,
                    all_tool_calls,
                    recovered: false,
                    recovered_error: None,
                    usage,
                };
            }

            // Execute each requested tool, capturing output or error
            let mut results = Vec::with_capacity(result.tool_calls.len());
            for call in &result.tool_calls {
                if ctx.cancel.is_cancelled() {
                    let cancelled = Message::assistant("Request cancelled by user.");
                    appended.push(cancelled.clone());
                    return TurnOutcome {
                        final_text: cancelled.content,
                        appended,
                        all_tool_calls,
                        recovered: true,
                        recovered_error: Some("cancelled".to_string()),
                        usage,
                    };
                }

                let executed =
                    tokio::time::timeout(self.options.tool_timeout, executor(call.clone())).await;
                let (content, is_error) = match executed {
                    Ok(Ok(output)) => (output, false),
                    Ok(Err(error)) => {
                        log::warn!("tool {} failed: {}", call.name, error);
                        (format!("Error: {}", error), true)
                    }
                    Err(_) => {
                        log::warn!(
                            "tool {} timed out after {:?}",
                            call.name,
                            self.options.tool_timeout
                        );
                        (
                            format!(
                                "Error: tool execution timed out after {} seconds",
                                self.options.tool_timeout.as_secs()
                            ),
                            true,
                        )
                    }
                };

                results.push(ToolResult {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content,
                    is_error,
                });
            }

            all_tool_calls.extend(result.tool_calls.clone());

            // Append the assistant message and provider-shaped results, then
            // re-enter the loop
            let formatted = adapter.format_tool_results(&results);
            appended.push(result.message.clone());
            appended.extend(formatted.clone());
            working.push(result.message);
            working.extend(formatted);

            rounds += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Adapter that requests a tool on the first call, then answers using
    /// the tool result it sees in history
    struct AddAdapter {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for AddAdapter {
        fn provider_id(&self) -> &str {
            "openai"
        }

        fn model(&self) -> &str {
            "gpt-4o"
        }

        fn max_output_tokens(&self) -> u32 {
            4096
        }

        async fn call(
            &self,
            messages: &[Message],
            tools: &[Tool],
            _ctx: &CallContext,
        ) -> Result<AdapterResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 && !tools.is_empty() {
                let calls = vec![ToolCall {
                    id: "call_add".to_string(),
                    name: "add".to_string(),
                    arguments: r#"{"a": 2, "b": 2}"#.to_string(),
                }];
                let mut message = Message::assistant("");
                message.tool_calls = Some(calls.clone());
                return Ok(AdapterResponse {
                    message,
                    tool_calls: calls,
                    usage: TokenUsage::default(),
                    tools_skipped: None,
                });
            }

            // Answer from the last tool message
            let answer = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Tool)
                .map(|m| format!("The answer is {}", m.content))
                .unwrap_or_else(|| "No tool result found".to_string());
            Ok(AdapterResponse::from_text(answer, TokenUsage::default()))
        }

        async fn call_stream(
            &self,
            messages: &[Message],
            tools: &[Tool],
            _on_chunk: ChunkSink<'_>,
            ctx: &CallContext,
        ) -> Result<AdapterResponse, ProviderError> {
            self.call(messages, tools, ctx).await
        }

        fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
            results
                .iter()
                .map(|r| Message::tool(r.tool_call_id.clone(), r.content.clone()))
                .collect()
        }
    }

    /// Adapter that always requests another tool call
    struct GreedyAdapter;

    #[async_trait::async_trait]
    impl ProviderAdapter for GreedyAdapter {
        fn provider_id(&self) -> &str {
            "openai"
        }

        fn model(&self) -> &str {
            "gpt-4o"
        }

        fn max_output_tokens(&self) -> u32 {
            4096
        }

        async fn call(
            &self,
            _messages: &[Message],
            tools: &[Tool],
            _ctx: &CallContext,
        ) -> Result<AdapterResponse, ProviderError> {
            if tools.is_empty() {
                return Ok(AdapterResponse::from_text(
                    "Done without tools".to_string(),
                    TokenUsage::default(),
                ));
            }
            let calls = vec![ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                name: "add".to_string(),
                arguments: r#"{"a": 1, "b": 1}"#.to_string(),
            }];
            let mut message = Message::assistant("");
            message.tool_calls = Some(calls.clone());
            Ok(AdapterResponse {
                message,
                tool_calls: calls,
                usage: TokenUsage::default(),
                tools_skipped: None,
            })
        }

        async fn call_stream(
            &self,
            messages: &[Message],
            tools: &[Tool],
            _on_chunk: ChunkSink<'_>,
            ctx: &CallContext,
        ) -> Result<AdapterResponse, ProviderError> {
            self.call(messages, tools, ctx).await
        }

        fn format_tool_results(&self, results: &[ToolResult]) -> Vec<Message> {
            results
                .iter()
                .map(|r| Message::tool(r.tool_call_id.clone(), r.content.clone()))
                .collect()
        }
    }

    fn add_tool() -> Tool {
        Tool::new(
            "add",
            "Add two integers",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "a": { "type": "integer" },
                    "b": { "type": "integer" }
                },
                "required": ["a", "b"]
            }),
        )
    }

    fn add_executor() -> ToolExecutor {
        executor_fn(|call: ToolCall| async move {
            let args = call.parsed_arguments().map_err(|e| e.to_string())?;
            let a = args["a"].as_i64().ok_or("missing a")?;
            let b = args["b"].as_i64().ok_or("missing b")?;
            Ok((a + b).to_string())
        })
    }

    #[tokio::test]
    async fn tool_call_happy_path() {
        let adapter = AddAdapter {
            calls: AtomicU32::new(0),
        };
        let orchestrator = Orchestrator::new(TurnOptions {
            streaming: false,
            ..Default::default()
        });

        let history = vec![Message::user("what's 2+2?")];
        let outcome = orchestrator
            .run_turn(
                &adapter,
                &history,
                &[add_tool()],
                &add_executor(),
                null_sink(),
                &CallContext::default(),
            )
            .await;

        assert!(!outcome.recovered);
        assert!(outcome.final_text.contains('4'), "{}", outcome.final_text);
        assert_eq!(outcome.all_tool_calls.len(), 1);
        assert_eq!(outcome.all_tool_calls[0].name, "add");

        // Appended: assistant w/ tool call, tool result, final assistant
        assert_eq!(outcome.appended.len(), 3);
        assert_eq!(outcome.appended[0].role, Role::Assistant);
        assert_eq!(outcome.appended[1].role, Role::Tool);
        assert_eq!(outcome.appended[2].role, Role::Assistant);

        // Tool message ids reference the prior assistant's calls
        let ids: Vec<&str> = outcome.appended[0]
            .tool_calls
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert!(ids.contains(&outcome.appended[1].tool_call_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn turn_cap_disables_tools_for_final_call() {
        let orchestrator = Orchestrator::new(TurnOptions {
            max_tool_turns: 3,
            streaming: false,
            ..Default::default()
        });

        let outcome = orchestrator
            .run_turn(
                &GreedyAdapter,
                &[Message::user("loop forever")],
                &[add_tool()],
                &add_executor(),
                null_sink(),
                &CallContext::default(),
            )
            .await;

        assert!(!outcome.recovered);
        assert_eq!(outcome.final_text, "Done without tools");
        assert_eq!(outcome.all_tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn tool_errors_are_captured_as_tool_messages() {
        let adapter = AddAdapter {
            calls: AtomicU32::new(0),
        };
        let orchestrator = Orchestrator::new(TurnOptions {
            streaming: false,
            ..Default::default()
        });

        let failing: ToolExecutor =
            executor_fn(|_call: ToolCall| async move { Err("boom".to_string()) });

        let outcome = orchestrator
            .run_turn(
                &adapter,
                &[Message::user("what's 2+2?")],
                &[add_tool()],
                &failing,
                null_sink(),
                &CallContext::default(),
            )
            .await;

        assert!(!outcome.recovered);
        let tool_msg = outcome
            .appended
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("boom"));
    }

    #[tokio::test]
    async fn tool_timeout_is_reported() {
        let adapter = AddAdapter {
            calls: AtomicU32::new(0),
        };
        let orchestrator = Orchestrator::new(TurnOptions {
            tool_timeout: Duration::from_millis(20),
            streaming: false,
            ..Default::default()
        });

        let slow: ToolExecutor = executor_fn(|_call: ToolCall| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        });

        let outcome = orchestrator
            .run_turn(
                &adapter,
                &[Message::user("what's 2+2?")],
                &[add_tool()],
                &slow,
                null_sink(),
                &CallContext::default(),
            )
            .await;

        let tool_msg = outcome
            .appended
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.contains("timed out"));
    }

    #[tokio::test]
    async fn pre_cancelled_turn_synthesizes_cancelled_reply() {
        let adapter = AddAdapter {
            calls: AtomicU32::new(0),
        };
        let orchestrator = Orchestrator::new(TurnOptions {
            streaming: false,
            ..Default::default()
        });

        let (handle, token) = CancelToken::pair();
        handle.cancel();
        let ctx = CallContext {
            cancel: token,
            ..Default::default()
        };

        let outcome = orchestrator
            .run_turn(
                &adapter,
                &[Message::user("what's 2+2?")],
                &[add_tool()],
                &add_executor(),
                null_sink(),
                &ctx,
            )
            .await;

        assert!(outcome.recovered);
        assert!(outcome.final_text.to_lowercase().contains("cancel"));
    }
}
