// Axum routes for the external chat surface: pairing, account management,
// the Telegram webhook and service status.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use super::service::ExternalChatService;
use super::telegram::{verify_webhook_secret, TelegramUpdate};
use crate::chat::pairing::PairingError;

#[derive(Clone)]
pub struct ChatState {
    pub service: Arc<ExternalChatService>,
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/external-chat/pair", post(issue_pairing))
        .route("/external-chat/accounts", get(list_accounts))
        .route("/external-chat/accounts/{id}", delete(remove_account))
        .route("/external-chat/telegram/webhook", post(telegram_webhook))
        .route("/external-chat/status", get(status))
        .with_state(state)
}

/// Bearer tokens are opaque principals; the token itself identifies the
/// user for this surface
fn principal(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.to_string())
        .filter(|token| !token.is_empty())
}

async fn issue_pairing(State(state): State<ChatState>, headers: HeaderMap) -> Response {
    let Some(user_id) = principal(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.service.pairing().issue(&user_id).await {
        Ok(issued) => Json(serde_json::json!({
            "code": issued.code,
            "expires_at": issued.expires_at.to_rfc3339(),
            "expires_in": issued.expires_in,
        }))
        .into_response(),
        Err(err @ PairingError::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": err.reason()})),
        )
            .into_response(),
        Err(err) => {
            log::error!("pairing issuance failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.reason()})),
            )
                .into_response()
        }
    }
}

async fn list_accounts(State(state): State<ChatState>, headers: HeaderMap) -> Response {
    let Some(user_id) = principal(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.service.list_accounts(&user_id).await {
        Ok(accounts) => {
            let rendered: Vec<serde_json::Value> = accounts
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "id": a.id,
                        "platform": a.platform,
                        "external_id": a.external_id,
                        "external_username": a.external_username,
                        "paired_at": a.paired_at.to_rfc3339(),
                        "last_message_at": a.last_message_at.map(|t| t.to_rfc3339()),
                    })
                })
                .collect();
            Json(serde_json::json!({ "accounts": rendered })).into_response()
        }
        Err(err) => {
            log::error!("account listing failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn remove_account(
    State(state): State<ChatState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = principal(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.service.delete_account(&user_id, id).await {
        Ok(true) => Json(serde_json::json!({"deleted": true})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            log::error!("account deletion failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Always answers 200 so the platform never retries; processing happens on
/// a detached task
async fn telegram_webhook(
    State(state): State<ChatState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let presented = headers
        .get("x-telegram-bot-api-secret-token")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_secret(state.service.webhook_secret(), presented) {
        // Still 200: the update is dropped, but Telegram must not retry it
        log::warn!("telegram webhook rejected: bad secret token");
        return StatusCode::OK.into_response();
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            log::warn!("unparseable telegram update: {}", err);
            return StatusCode::OK.into_response();
        }
    };

    let Some(message) = update.message else {
        return StatusCode::OK.into_response();
    };
    let Some(text) = message.text.clone() else {
        return StatusCode::OK.into_response();
    };
    let Some(from) = message.from.clone() else {
        return StatusCode::OK.into_response();
    };

    let service = state.service.clone();
    tokio::spawn(async move {
        service
            .handle_inbound(
                "telegram",
                &from.id.to_string(),
                message.chat.id,
                from.username.as_deref(),
                &text,
            )
            .await;
    });

    StatusCode::OK.into_response()
}

async fn status(State(state): State<ChatState>) -> Response {
    Json(state.service.status()).into_response()
}
