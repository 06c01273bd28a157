// Token-aware truncation of conversation history.
// When a call overflows the model's window, oldest interior turns are
// evicted while the system prompt, the first user turn and assistant/tool
// pairings are preserved.

use super::provider::{Message, Role, Tool};

/// Approximate bytes per token for the surrogate estimator
const BYTES_PER_TOKEN: usize = 4;

/// Fixed per-message overhead (role, framing) in tokens
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Portion of the window held back for the model's own output
const OUTPUT_RESERVE_TOKENS: u32 = 8_192;

/// Outcome of one management pass
#[derive(Debug, Clone)]
pub struct ManagedMessages {
    pub messages: Vec<Message>,
    pub original_tokens: u32,
    pub managed_tokens: u32,
    /// True when history was reduced and now fits. False either when no
    /// reduction was needed or when no legal reduction could make it fit;
    /// callers distinguish the two by comparing token counts to the cap.
    pub was_managed: bool,
}

/// Context window sizes by model-id substring, most specific first
fn context_window(model: &str) -> u32 {
    const TABLE: [(&str, u32); 8] = [
        ("gpt-5", 272_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_000_000),
        ("o3", 200_000),
        ("claude", 200_000),
        ("gemini", 1_000_000),
        ("llama", 128_000),
        ("qwen", 131_072),
    ];
    for (needle, window) in TABLE {
        if model.contains(needle) {
            return window;
        }
    }
    128_000
}

fn soft_cap(model: &str) -> u32 {
    context_window(model).saturating_sub(OUTPUT_RESERVE_TOKENS)
}

/// Byte-pair length surrogate: cheap, provider-agnostic, deliberately
/// pessimistic for short messages via the per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> u32 {
    let mut bytes = message.content.len();
    if let Some(parts) = &message.parts {
        for part in parts {
            bytes += serde_json::to_string(part).map(|s| s.len()).unwrap_or(0);
        }
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            bytes += call.name.len() + call.arguments.len();
        }
    }
    (bytes / BYTES_PER_TOKEN) as u32 + MESSAGE_OVERHEAD_TOKENS
}

fn estimate_tools_tokens(tools: &[Tool]) -> u32 {
    tools
        .iter()
        .map(|tool| {
            let schema = serde_json::to_string(&tool.parameters)
                .map(|s| s.len())
                .unwrap_or(0);
            ((tool.name.len() + tool.description.len() + schema) / BYTES_PER_TOKEN) as u32
        })
        .sum()
}

fn estimate_total(messages: &[Message], tools: &[Tool]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum::<u32>() + estimate_tools_tokens(tools)
}

/// An eviction unit: either a single message or an assistant message with
/// tool calls together with all its tool responses. Units are removed whole
/// so assistant/tool pairing stays consistent.
#[derive(Debug)]
struct EvictionUnit {
    start: usize,
    end: usize, // exclusive
    tokens: u32,
    protected: bool,
}

fn build_units(messages: &[Message]) -> Vec<EvictionUnit> {
    let mut units = Vec::new();
    let mut first_user_seen = false;
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];
        let start = i;
        let mut protected = false;

        match msg.role {
            Role::System => {
                protected = true;
                i += 1;
            }
            Role::User if !first_user_seen => {
                first_user_seen = true;
                protected = true;
                i += 1;
            }
            Role::Assistant if msg.tool_calls.is_some() => {
                i += 1;
                while i < messages.len() && messages[i].role == Role::Tool {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }

        let tokens = messages[start..i].iter().map(estimate_message_tokens).sum();
        units.push(EvictionUnit {
            start,
            end: i,
            tokens,
            protected,
        });
    }

    // The trailing unit is the turn being answered; never evict it
    if let Some(last) = units.last_mut() {
        last.protected = true;
    }

    units
}

/// Reduce `messages` until the estimate fits under the model's soft cap.
pub fn manage(messages: &[Message], model: &str, tools: &[Tool]) -> ManagedMessages {
    let original_tokens = estimate_total(messages, tools);
    let cap = soft_cap(model);

    if original_tokens <= cap {
        return ManagedMessages {
            messages: messages.to_vec(),
            original_tokens,
            managed_tokens: original_tokens,
            was_managed: false,
        };
    }

    let units = build_units(messages);
    let tools_tokens = estimate_tools_tokens(tools);
    let mut running = original_tokens;
    let mut evicted = vec![false; units.len()];

    // Oldest interior units go first
    for (idx, unit) in units.iter().enumerate() {
        if running <= cap {
            break;
        }
        if unit.protected {
            continue;
        }
        evicted[idx] = true;
        running = running.saturating_sub(unit.tokens);
    }

    if running > cap {
        // Maximal legal reduction still does not fit; leave history intact
        // and let the caller surface a token-limit error
        return ManagedMessages {
            messages: messages.to_vec(),
            original_tokens,
            managed_tokens: original_tokens,
            was_managed: false,
        };
    }

    let mut kept = Vec::with_capacity(messages.len());
    for (idx, unit) in units.iter().enumerate() {
        if !evicted[idx] {
            kept.extend(messages[unit.start..unit.end].iter().cloned());
        }
    }

    let managed_tokens = estimate_total(&kept, tools);
    ManagedMessages {
        messages: kept,
        original_tokens,
        managed_tokens,
        was_managed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ToolCall;

    fn filler(role: Role, bytes: usize) -> Message {
        match role {
            Role::User => Message::user("u".repeat(bytes)),
            Role::Assistant => Message::assistant("a".repeat(bytes)),
            _ => Message::system("s".repeat(bytes)),
        }
    }

    fn tool_turn(id: &str, bytes: usize) -> Vec<Message> {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = Some(vec![ToolCall {
            id: id.to_string(),
            name: "lookup".to_string(),
            arguments: format!(r#"{{"payload":"{}"}}"#, "x".repeat(bytes)),
        }]);
        vec![assistant, Message::tool(id, "y".repeat(bytes))]
    }

    #[test]
    fn under_cap_returns_unchanged() {
        let messages = vec![Message::system("be nice"), Message::user("hello")];
        let managed = manage(&messages, "gpt-4o", &[]);
        assert!(!managed.was_managed);
        assert_eq!(managed.messages.len(), 2);
        assert_eq!(managed.managed_tokens, managed.original_tokens);
    }

    #[test]
    fn evicts_oldest_interior_turns_first() {
        // Window for "llama" is 128k tokens; build ~180k tokens of history
        let mut messages = vec![Message::system("sys"), Message::user("first question")];
        for _ in 0..18 {
            messages.push(filler(Role::Assistant, 20_000));
            messages.push(filler(Role::User, 20_000));
        }
        messages.push(Message::user("latest question"));

        let managed = manage(&messages, "llama-3.3-70b", &[]);
        assert!(managed.was_managed);
        assert!(managed.managed_tokens <= soft_cap("llama-3.3-70b"));
        assert!(managed.managed_tokens < managed.original_tokens);

        // Protected prefix and suffix survive
        assert_eq!(managed.messages[0].content, "sys");
        assert_eq!(managed.messages[1].content, "first question");
        assert_eq!(
            managed.messages.last().unwrap().content,
            "latest question"
        );
    }

    #[test]
    fn assistant_tool_pairs_evict_as_a_unit() {
        let mut messages = vec![Message::system("sys"), Message::user("q")];
        for i in 0..12 {
            messages.extend(tool_turn(&format!("call_{}", i), 30_000));
        }
        messages.push(Message::user("latest"));

        let managed = manage(&messages, "llama-3.3-70b", &[]);
        assert!(managed.was_managed);

        // Every surviving tool message still has its assistant partner
        for (i, msg) in managed.messages.iter().enumerate() {
            if msg.role == Role::Tool {
                let id = msg.tool_call_id.as_deref().unwrap();
                let prior = &managed.messages[i - 1];
                let matched = match prior.role {
                    Role::Assistant => prior
                        .tool_calls
                        .as_ref()
                        .map(|calls| calls.iter().any(|c| c.id == id))
                        .unwrap_or(false),
                    Role::Tool => true, // sibling result of the same assistant turn
                    _ => false,
                };
                assert!(matched, "orphan tool message at {}", i);
            }
        }
    }

    #[test]
    fn unreducible_history_signals_failure() {
        // A single gigantic protected user turn cannot be evicted
        let messages = vec![
            Message::system("sys"),
            Message::user("x".repeat(900_000 * BYTES_PER_TOKEN)),
        ];
        let managed = manage(&messages, "llama-3.3-70b", &[]);
        assert!(!managed.was_managed);
        assert_eq!(managed.managed_tokens, managed.original_tokens);
        assert_eq!(managed.messages.len(), 2);
    }

    #[test]
    fn boundary_just_under_cap() {
        let cap = soft_cap("llama-3.3-70b");
        let body_tokens = cap - MESSAGE_OVERHEAD_TOKENS - 100;
        let messages = vec![Message::user("x".repeat(body_tokens as usize * BYTES_PER_TOKEN))];
        let managed = manage(&messages, "llama-3.3-70b", &[]);
        assert!(!managed.was_managed);
    }

    #[test]
    fn tool_schemas_count_toward_the_estimate() {
        let tools = vec![Tool::new(
            "big",
            "d".repeat(1000),
            serde_json::json!({"type": "object", "properties": {}}),
        )];
        let none: Vec<Tool> = Vec::new();
        let messages = vec![Message::user("hi")];
        let with_tools = manage(&messages, "gpt-4o", &tools);
        let without = manage(&messages, "gpt-4o", &none);
        assert!(with_tools.original_tokens > without.original_tokens);
    }
}
