// Retry engine wrapping every adapter call.
// Exponential backoff with jitter, a token-reduction branch that does not
// consume an attempt, corrective guidance for invalid tool calls, and a
// never-throw contract: exhausted calls come back as a synthesized
// assistant message tagged `recovered`.

use rand::Rng;
use std::time::Duration;

use super::context;
use super::error::{classify, ErrorClass, ProviderError};
use super::provider::*;
use super::validator;

/// Backoff schedule for one adapter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
    pub rate_limit_base: Duration,
    pub rate_limit_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            rate_limit_base: Duration::from_secs(30),
            rate_limit_cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Cerebras rate limits aggressively and needs a heavier schedule
    pub fn for_provider(provider_id: &str) -> Self {
        match provider_id {
            "cerebras" => Self {
                max_retries: 5,
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
                rate_limit_base: Duration::from_secs(30),
                rate_limit_cap: Duration::from_secs(300),
            },
            _ => Self::default(),
        }
    }

    /// `min(base * 2^attempt + U(0, 0.1 * base * 2^attempt), cap)`
    pub fn backoff_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let (base, cap) = if rate_limited {
            (self.rate_limit_base, self.rate_limit_cap)
        } else {
            (self.base, self.cap)
        };

        let exp = base.as_secs_f64() * f64::from(1u32 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0.0..=(exp * 0.1));
        Duration::from_secs_f64((exp + jitter).min(cap.as_secs_f64()))
    }
}

/// Per-call state machine around one adapter
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn for_adapter(adapter: &dyn ProviderAdapter) -> Self {
        Self::new(RetryPolicy::for_provider(adapter.provider_id()))
    }

    /// Run one (streaming) model call to a total result. This function never
    /// fails; callers inspect `recovered` to tell completions from
    /// recoveries.
    pub async fn execute(
        &self,
        adapter: &dyn ProviderAdapter,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: ChunkSink<'_>,
        ctx: &CallContext,
        streaming: bool,
    ) -> CallResult {
        // Local working copy; caller-visible state is never touched until
        // the result is returned
        let mut working = messages.to_vec();
        let mut attempt: u32 = 0;
        let mut usage = TokenUsage::default();

        loop {
            if ctx.cancel.is_cancelled() {
                return cancelled_result(usage);
            }

            let outcome = if streaming {
                adapter.call_stream(&working, tools, on_chunk, ctx).await
            } else {
                adapter.call(&working, tools, ctx).await
            };

            match outcome {
                Ok(response) => {
                    usage.add(&response.usage);

                    if response.tool_calls.is_empty() {
                        return CallResult {
                            message: response.message,
                            tool_calls: Vec::new(),
                            recovered: false,
                            recovered_error: None,
                            invalid_tool_calls: Vec::new(),
                            tools_skipped: response.tools_skipped,
                            usage,
                        };
                    }

                    let (valid, invalid) = validator::validate(&response.tool_calls, tools);

                    if valid.is_empty() && !invalid.is_empty() {
                        // Every call was rejected; coach the model and retry
                        if attempt >= self.policy.max_retries {
                            return CallResult::recovery(
                                "I could not produce a valid tool call for this request."
                                    .to_string(),
                                format!("{} invalid tool call(s) after retries", invalid.len()),
                                usage,
                            );
                        }
                        log::warn!(
                            "all {} tool call(s) failed validation; injecting guidance (attempt {})",
                            invalid.len(),
                            attempt
                        );
                        working.push(Message::system(validator::retry_guidance(&invalid, tools)));
                        if !self.sleep(attempt, false, ctx).await {
                            return cancelled_result(usage);
                        }
                        attempt += 1;
                        continue;
                    }

                    // Valid calls proceed; rejected ones ride along as a
                    // sidecar for observability
                    let mut message = response.message;
                    message.tool_calls = if valid.is_empty() {
                        None
                    } else {
                        Some(valid.clone())
                    };

                    return CallResult {
                        message,
                        tool_calls: valid,
                        recovered: false,
                        recovered_error: None,
                        invalid_tool_calls: invalid,
                        tools_skipped: response.tools_skipped,
                        usage,
                    };
                }
                Err(ProviderError::Cancelled) => {
                    return cancelled_result(usage);
                }
                Err(err) => {
                    let classified = classify(&err);
                    log::warn!(
                        "provider {} call failed ({:?}): {}",
                        adapter.provider_id(),
                        classified.class,
                        err
                    );

                    match classified.class {
                        ErrorClass::TokenLimit => {
                            let managed =
                                context::manage(&working, adapter.model(), tools);
                            if managed.was_managed {
                                log::info!(
                                    "reduced context from {} to {} tokens",
                                    managed.original_tokens,
                                    managed.managed_tokens
                                );
                                working = managed.messages;
                                // Reduction does not consume an attempt
                                continue;
                            }
                            return CallResult::recovery(
                                classified.user_message,
                                err.to_string(),
                                usage,
                            );
                        }
                        class if class.is_retryable() && attempt < self.policy.max_retries => {
                            let rate_limited = class == ErrorClass::RateLimit;
                            if !self.sleep(attempt, rate_limited, ctx).await {
                                return cancelled_result(usage);
                            }
                            attempt += 1;
                        }
                        _ => {
                            return CallResult::recovery(
                                classified.user_message,
                                err.to_string(),
                                usage,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Backoff sleep; returns false when cancelled mid-sleep
    async fn sleep(&self, attempt: u32, rate_limited: bool, ctx: &CallContext) -> bool {
        let delay = self.policy.backoff_delay(attempt, rate_limited);
        log::debug!("backing off {:?} before attempt {}", delay, attempt + 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = ctx.cancel.cancelled() => false,
        }
    }
}

fn cancelled_result(usage: TokenUsage) -> CallResult {
    CallResult::recovery(
        "Request cancelled by user.".to_string(),
        "cancelled".to_string(),
        usage,
    )
}
