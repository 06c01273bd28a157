// Axum routes for the public webhook trigger surface.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;

use super::dispatcher::WebhookDispatcher;

#[derive(Clone)]
pub struct WebhookState {
    pub dispatcher: Arc<WebhookDispatcher>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/trigger/{workflow_id}", any(trigger_handler))
        .with_state(state)
}

async fn trigger_handler(
    State(state): State<WebhookState>,
    Path(workflow_id): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    // The body is forwarded verbatim; non-JSON payloads travel as a string
    let body_value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
        })
    };

    let result = state
        .dispatcher
        .handle_trigger(&workflow_id, method.as_str(), &header_map, &query, body_value)
        .await;

    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, result.content_type)],
        result.body,
    )
        .into_response()
}
