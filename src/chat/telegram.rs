// Minimal Telegram Bot API client over reqwest: outbound sendMessage with
// platform-limit chunking, inbound update envelope types, and webhook
// secret verification.

use serde::{Deserialize, Serialize};

use super::buffer::split_message;
use crate::webhooks::constant_time_eq;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram's hard message limit is 4096; stay under it
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    /// Send `text` to a chat, splitting into platform-sized pieces. Pieces
    /// go out sequentially so ordering is preserved.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), String> {
        for piece in split_message(text, TELEGRAM_MESSAGE_LIMIT) {
            let request = SendMessageRequest {
                chat_id,
                text: piece,
            };
            let response = self
                .client
                .post(self.method_url("sendMessage"))
                .json(&request)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(format!("telegram sendMessage failed ({}): {}", status, body));
            }
        }
        Ok(())
    }

    /// Register the webhook endpoint with Telegram
    pub async fn set_webhook(
        &self,
        url: &str,
        secret_token: Option<&str>,
    ) -> Result<(), String> {
        let request = SetWebhookRequest {
            url: url.to_string(),
            secret_token: secret_token.map(|s| s.to_string()),
        };
        self.client
            .post(self.method_url("setWebhook"))
            .json(&request)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Verify the `X-Telegram-Bot-Api-Secret-Token` header. A missing
/// configured secret accepts everything (dev mode).
pub fn verify_webhook_secret(configured: Option<&str>, presented: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) if expected.is_empty() => true,
        Some(expected) => presented
            .map(|got| constant_time_eq(got, expected))
            .unwrap_or(false),
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    chat_id: i64,
    text: String,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_token: Option<String>,
}

/// Inbound update envelope (the fields this service consumes)
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}
