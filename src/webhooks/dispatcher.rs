// Webhook dispatch: the synchronous push path behind the tunnel and the
// remote-poll slowpath that drains the aggregator when no tunnel is up.
// Authorization happens here, against the registry's in-memory records,
// with constant-time credential comparison.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use super::registry::{HookAuth, WebhookRegistry};
use super::template;
use crate::llm::CancelToken;

/// How often the remote aggregator is polled
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Budget for one full poll cycle
pub const POLL_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for wait-for-result responses
pub const WAIT_DEADLINE: Duration = Duration::from_secs(30);

/// One in-flight trigger, from ingress to dispatch confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEnvelope {
    pub trigger_id: String,
    pub workflow_id: String,
    pub received_at: DateTime<Utc>,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow engine unavailable")]
    Unavailable,

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// The in-process workflow engine, injected by the host application.
/// Dispatch returns a receiver that resolves with the run's output
/// bindings; a run may legitimately complete with `null`.
#[async_trait::async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn is_ready(&self, workflow_id: &str) -> bool;

    async fn dispatch(
        &self,
        trigger: TriggerEnvelope,
    ) -> Result<oneshot::Receiver<serde_json::Value>, EngineError>;
}

/// HTTP-shaped outcome handed back to the transport layer
#[derive(Debug, Clone)]
pub struct HookResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HookResponse {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.to_string(),
        }
    }
}

/// Constant-time string equality. Length is the only observable
/// difference.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    engine: Arc<dyn WorkflowEngine>,
    client: reqwest::Client,
    remote_url: Option<String>,
    polling_enabled: AtomicBool,
    wait_deadline: Duration,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        engine: Arc<dyn WorkflowEngine>,
        remote_url: Option<String>,
    ) -> Self {
        // Polling starts enabled whenever no tunnel is connected
        let polling = registry.tunnel().is_none() && remote_url.is_some();
        Self {
            registry,
            engine,
            client: reqwest::Client::new(),
            remote_url,
            polling_enabled: AtomicBool::new(polling),
            wait_deadline: WAIT_DEADLINE,
        }
    }

    pub fn with_wait_deadline(mut self, deadline: Duration) -> Self {
        self.wait_deadline = deadline;
        self
    }

    pub fn polling_enabled(&self) -> bool {
        self.polling_enabled.load(Ordering::SeqCst)
    }

    /// Tunnel connectivity changed. Disconnect enables polling; connect
    /// keeps it running only while remote-side registrations drain.
    pub fn on_tunnel_change(&self, tunnel_url: Option<String>) {
        let connected = tunnel_url.is_some();
        self.registry.set_tunnel(tunnel_url);
        if connected {
            let keep = self.registry.has_remote_registrations();
            self.polling_enabled.store(keep, Ordering::SeqCst);
            if keep {
                log::info!("tunnel connected; polling continues while remote registrations drain");
            }
        } else if self.remote_url.is_some() {
            self.polling_enabled.store(true, Ordering::SeqCst);
            log::info!("tunnel disconnected; remote polling enabled");
        }
    }

    /// Synchronous push path: lookup, authorize, dispatch, respond
    pub async fn handle_trigger(
        &self,
        workflow_id: &str,
        method: &str,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        body: serde_json::Value,
    ) -> HookResponse {
        let Some(config) = self.registry.get(workflow_id) else {
            return HookResponse::json(
                404,
                serde_json::json!({"error": "unknown workflow"}),
            );
        };

        if !config.method.accepts(method) {
            return HookResponse::json(
                405,
                serde_json::json!({"error": "method not allowed"}),
            );
        }

        if !authorize(&config.auth, headers) {
            log::warn!("webhook auth failed for workflow {}", workflow_id);
            return HookResponse::json(401, serde_json::json!({"error": "unauthorized"}));
        }

        if !self.engine.is_ready(workflow_id) {
            return HookResponse::json(
                503,
                serde_json::json!({"error": "workflow engine unavailable"}),
            );
        }

        let envelope = TriggerEnvelope {
            trigger_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            received_at: Utc::now(),
            method: method.to_ascii_uppercase(),
            headers: headers.clone(),
            query: query.clone(),
            body,
        };

        let completion = match self.engine.dispatch(envelope).await {
            Ok(rx) => rx,
            Err(EngineError::Unavailable) => {
                return HookResponse::json(
                    503,
                    serde_json::json!({"error": "workflow engine unavailable"}),
                );
            }
            Err(EngineError::Dispatch(reason)) => {
                log::error!("dispatch failed for {}: {}", workflow_id, reason);
                return HookResponse::json(
                    503,
                    serde_json::json!({"error": "dispatch failed"}),
                );
            }
        };

        match config.response_mode {
            super::registry::ResponseMode::Immediate => HookResponse::json(
                200,
                serde_json::json!({"success": true, "workflow_id": workflow_id}),
            ),
            super::registry::ResponseMode::WaitForResult => {
                match tokio::time::timeout(self.wait_deadline, completion).await {
                    Ok(Ok(output)) => {
                        // Completion output only, never partial state. A null
                        // output still counts as a completed run.
                        match &config.response_template {
                            Some(tpl) => HookResponse {
                                status: 200,
                                content_type: config
                                    .response_content_type
                                    .clone()
                                    .unwrap_or_else(|| "text/plain".to_string()),
                                body: template::resolve(tpl, &output),
                            },
                            None => HookResponse {
                                status: 200,
                                content_type: config
                                    .response_content_type
                                    .clone()
                                    .unwrap_or_else(|| "application/json".to_string()),
                                body: output.to_string(),
                            },
                        }
                    }
                    Ok(Err(_)) => HookResponse::json(
                        200,
                        serde_json::json!({
                            "success": true,
                            "warning": "workflow finished without output"
                        }),
                    ),
                    Err(_) => HookResponse::json(
                        200,
                        serde_json::json!({
                            "success": true,
                            "timeout": true,
                            "message": "workflow accepted but did not complete in time"
                        }),
                    ),
                }
            }
        }
    }

    /// One remote poll cycle: fetch queued triggers, dispatch those whose
    /// workflows are ready, confirm only the handled ids. Unconfirmed
    /// triggers reappear on the next cycle.
    pub async fn poll_once(&self) -> Result<usize, reqwest::Error> {
        let Some(remote) = &self.remote_url else {
            return Ok(0);
        };

        let response = self
            .client
            .get(format!("{}/webhooks/poll", remote.trim_end_matches('/')))
            .send()
            .await?
            .error_for_status()?;

        let batch: PollBatch = response.json().await?;
        if batch.triggers.is_empty() {
            return Ok(0);
        }

        let mut processed = Vec::new();
        for trigger in batch.triggers {
            if self.registry.get(&trigger.workflow_id).is_none()
                || !self.engine.is_ready(&trigger.workflow_id)
            {
                // Not ready; leave unconfirmed so it reappears
                log::debug!(
                    "leaving trigger {} for workflow {} unconfirmed",
                    trigger.id,
                    trigger.workflow_id
                );
                continue;
            }

            let result = self
                .handle_trigger(
                    &trigger.workflow_id,
                    &trigger.method,
                    &trigger.headers,
                    &trigger.query,
                    trigger.body.clone(),
                )
                .await;

            processed.push(ProcessedTrigger {
                id: trigger.id,
                status: result.status,
                body: result.body,
            });
        }

        let handled = processed.len();
        if handled > 0 {
            self.client
                .post(format!(
                    "{}/webhooks/confirm-processed",
                    remote.trim_end_matches('/')
                ))
                .json(&ConfirmRequest { processed })
                .send()
                .await?
                .error_for_status()?;
        }

        Ok(handled)
    }

    /// Background poll loop; runs until the token cancels
    pub async fn run_poll_loop(self: Arc<Self>, shutdown: CancelToken) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("webhook poll loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !self.polling_enabled() {
                continue;
            }

            match tokio::time::timeout(POLL_CYCLE_TIMEOUT, self.poll_once()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => log::info!("processed {} remote trigger(s)", n),
                Ok(Err(err)) => log::warn!("remote poll failed: {}", err),
                Err(_) => log::warn!("remote poll cycle exceeded {:?}", POLL_CYCLE_TIMEOUT),
            }
        }
    }
}

/// Check request headers against the configured auth, constant-time
fn authorize(auth: &HookAuth, headers: &HashMap<String, String>) -> bool {
    let header = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .map(|(_, v)| v.as_str());

    match auth {
        HookAuth::None => true,
        HookAuth::Basic { user, pass } => {
            if user.is_empty() && pass.is_empty() {
                // Credentials not yet re-populated after restart
                return false;
            }
            let Some(value) = header else { return false };
            let Some(encoded) = value.strip_prefix("Basic ") else {
                return false;
            };
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(decoded) = String::from_utf8(decoded) else {
                return false;
            };
            let Some((got_user, got_pass)) = decoded.split_once(':') else {
                return false;
            };
            // Evaluate both comparisons; no early exit on user mismatch
            let user_ok = constant_time_eq(got_user, user);
            let pass_ok = constant_time_eq(got_pass, pass);
            user_ok && pass_ok
        }
        HookAuth::Bearer { token } | HookAuth::Signed { token } => {
            if token.is_empty() {
                return false;
            }
            let Some(value) = header else { return false };
            let presented = value.strip_prefix("Bearer ").unwrap_or(value);
            constant_time_eq(presented, token)
        }
    }
}

// ============================== Remote wire types ==============================

#[derive(Debug, Deserialize)]
struct PollBatch {
    #[serde(default)]
    triggers: Vec<RemoteTrigger>,
}

#[derive(Debug, Deserialize)]
struct RemoteTrigger {
    id: String,
    workflow_id: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    query: HashMap<String, String>,
    #[serde(default)]
    body: serde_json::Value,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Serialize)]
struct ConfirmRequest {
    processed: Vec<ProcessedTrigger>,
}

#[derive(Debug, Serialize)]
struct ProcessedTrigger {
    id: String,
    status: u16,
    body: String,
}
