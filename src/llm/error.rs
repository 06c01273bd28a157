// Provider error taxonomy and classification.
// Raw provider failures (HTTP status + body, transport errors) are folded
// into a small canonical set that drives the retry engine, plus a user-safe
// message that never echoes more than a truncated provider string.

use thiserror::Error;

/// Maximum number of raw provider characters echoed to users
const MAX_ECHOED_CHARS: usize = 200;

/// Provider error types
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-success HTTP response from the provider
    #[error("provider HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure (connect, timeout, reset, DNS)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failure while consuming an SSE / chunked stream
    #[error("stream error: {0}")]
    Stream(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Call aborted via its cancel token
    #[error("call cancelled")]
    Cancelled,

    /// Request exceeded its wall-clock budget
    #[error("request timeout")]
    Timeout,
}

impl ProviderError {
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        ProviderError::Api {
            status,
            body: body.into(),
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Canonical error classes, ordered roughly by how recoverable they are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    RateLimit,
    TokenLimit,
    InvalidToolCall,
    Auth,
    Fatal,
}

impl ErrorClass {
    /// Whether the retry engine should attempt the call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Retryable | ErrorClass::RateLimit | ErrorClass::InvalidToolCall
        )
    }
}

/// Result of classifying one provider error
#[derive(Debug, Clone)]
pub struct Classified {
    pub class: ErrorClass,
    /// Safe to surface to end users
    pub user_message: String,
}

/// Statuses every provider treats as transient
const RETRYABLE_STATUSES: [u16; 6] = [429, 500, 502, 503, 504, 529];

/// Parse a provider error into its canonical class plus a user-safe message
pub fn classify(error: &ProviderError) -> Classified {
    match error {
        ProviderError::Api { status, body } => classify_api(*status, body),
        ProviderError::Network(err) => classify_network(err),
        ProviderError::Stream(detail) => Classified {
            class: ErrorClass::Retryable,
            user_message: format!("The model stream was interrupted ({}).", truncate(detail)),
        },
        ProviderError::Timeout => Classified {
            class: ErrorClass::Retryable,
            user_message: "The model took too long to respond.".to_string(),
        },
        ProviderError::Json(err) => Classified {
            class: ErrorClass::Fatal,
            user_message: format!("The model returned an unreadable response ({}).", truncate(&err.to_string())),
        },
        ProviderError::Config(detail) => Classified {
            class: ErrorClass::Fatal,
            user_message: truncate(detail),
        },
        ProviderError::Cancelled => Classified {
            class: ErrorClass::Fatal,
            user_message: "Request cancelled by user.".to_string(),
        },
    }
}

fn classify_api(status: u16, body: &str) -> Classified {
    let message = unwrap_error_body(body);
    let lowered = message.to_lowercase();

    if RETRYABLE_STATUSES.contains(&status) {
        let class = if status == 429 {
            ErrorClass::RateLimit
        } else {
            ErrorClass::Retryable
        };
        return Classified {
            class,
            user_message: collapse_known_phrase(&lowered, &message, status),
        };
    }

    if status == 400 {
        if lowered.contains("token")
            || lowered.contains("context length")
            || lowered.contains("reduce the length")
            || lowered.contains("too long")
        {
            return Classified {
                class: ErrorClass::TokenLimit,
                user_message: "The conversation is too long for this model.".to_string(),
            };
        }
        if lowered.contains("function")
            || lowered.contains("tool")
            || lowered.contains("failed to call")
        {
            return Classified {
                class: ErrorClass::InvalidToolCall,
                user_message: "The model produced an invalid tool call.".to_string(),
            };
        }
    }

    if (status == 401 || status == 403)
        && (lowered.contains("api key") || lowered.contains("invalid_api_key"))
    {
        return Classified {
            class: ErrorClass::Auth,
            user_message: "The configured API key was rejected by the provider.".to_string(),
        };
    }

    Classified {
        class: ErrorClass::Fatal,
        user_message: collapse_known_phrase(&lowered, &message, status),
    }
}

fn classify_network(err: &reqwest::Error) -> Classified {
    // Connection resets, timeouts and name-resolution failures all surface
    // through reqwest as connect/timeout/request errors
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    Classified {
        class: if retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        },
        user_message: "Could not reach the model provider.".to_string(),
    }
}

/// Collapse well-known provider phrases into stable strings; unknown text
/// passes through verbatim, truncated.
fn collapse_known_phrase(lowered: &str, original: &str, status: u16) -> String {
    if lowered.contains("credit balance") {
        return "The provider account is out of credits.".to_string();
    }
    if lowered.contains("quota") {
        return "The provider quota has been exceeded.".to_string();
    }
    if lowered.contains("overloaded") {
        return "The model is temporarily overloaded. Please try again.".to_string();
    }
    if status == 429 {
        return "The provider is rate limiting requests. Please slow down.".to_string();
    }
    truncate(original)
}

/// Unwrap nested JSON error bodies; one provider double-encodes the inner
/// error object as a JSON string inside `message`.
pub fn unwrap_error_body(body: &str) -> String {
    unwrap_error_value(body, 0)
}

fn unwrap_error_value(body: &str, depth: usize) -> String {
    if depth >= 4 {
        return body.to_string();
    }

    let parsed: serde_json::Value = match serde_json::from_str(body.trim()) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };

    let inner = parsed
        .get("error")
        .cloned()
        .unwrap_or(parsed);

    if let Some(message) = inner.get("message").and_then(|m| m.as_str()) {
        // The message itself may be another encoded error object
        if message.trim_start().starts_with('{') {
            return unwrap_error_value(message, depth + 1);
        }
        return message.to_string();
    }

    if let Some(text) = inner.as_str() {
        if text.trim_start().starts_with('{') {
            return unwrap_error_value(text, depth + 1);
        }
        return text.to_string();
    }

    body.to_string()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ECHOED_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_ECHOED_CHARS).collect();
    format!("{}…", cut)
}
