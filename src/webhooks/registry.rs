// In-memory webhook registry with write-through persistence.
// Only metadata (method, auth type, response mode, template) is persisted;
// credentials live in process memory and are re-supplied by the workflow
// engine when a workflow activates.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::storage::{Store, StorageError, WebhookRow};

/// HTTP methods a webhook can accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Any,
}

impl HookMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookMethod::Get => "GET",
            HookMethod::Post => "POST",
            HookMethod::Put => "PUT",
            HookMethod::Patch => "PATCH",
            HookMethod::Delete => "DELETE",
            HookMethod::Any => "ANY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(HookMethod::Get),
            "POST" => Some(HookMethod::Post),
            "PUT" => Some(HookMethod::Put),
            "PATCH" => Some(HookMethod::Patch),
            "DELETE" => Some(HookMethod::Delete),
            "ANY" => Some(HookMethod::Any),
            _ => None,
        }
    }

    pub fn accepts(&self, request_method: &str) -> bool {
        *self == HookMethod::Any || request_method.eq_ignore_ascii_case(self.as_str())
    }
}

/// Authorization required by a webhook. Credential material never leaves
/// process memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAuth {
    None,
    Basic { user: String, pass: String },
    Bearer { token: String },
    Signed { token: String },
}

impl HookAuth {
    pub fn type_str(&self) -> &'static str {
        match self {
            HookAuth::None => "none",
            HookAuth::Basic { .. } => "basic",
            HookAuth::Bearer { .. } => "bearer",
            HookAuth::Signed { .. } => "signed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Immediate,
    WaitForResult,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Immediate => "immediate",
            ResponseMode::WaitForResult => "wait_for_result",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "immediate" => Some(ResponseMode::Immediate),
            "wait_for_result" => Some(ResponseMode::WaitForResult),
            _ => None,
        }
    }
}

/// Full webhook configuration for one workflow
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub user_id: String,
    pub method: HookMethod,
    pub auth: HookAuth,
    pub response_mode: ResponseMode,
    pub response_template: Option<String>,
    pub response_content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(user_id: impl Into<String>, method: HookMethod) -> Self {
        Self {
            user_id: user_id.into(),
            method,
            auth: HookAuth::None,
            response_mode: ResponseMode::Immediate,
            response_template: None,
            response_content_type: None,
            created_at: Utc::now(),
        }
    }
}

/// Registry of workflow-id -> webhook config.
/// Reads hit the in-memory map; writes are serialized by a single async
/// mutex and written through to storage.
pub struct WebhookRegistry {
    hooks: RwLock<HashMap<String, WebhookConfig>>,
    /// Workflow ids registered while only the remote template was available
    remote_registered: RwLock<HashSet<String>>,
    tunnel_url: RwLock<Option<String>>,
    remote_url: Option<String>,
    write_lock: tokio::sync::Mutex<()>,
    store: Store,
}

impl WebhookRegistry {
    pub fn new(store: Store, tunnel_url: Option<String>, remote_url: Option<String>) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            remote_registered: RwLock::new(HashSet::new()),
            tunnel_url: RwLock::new(tunnel_url),
            remote_url,
            write_lock: tokio::sync::Mutex::new(()),
            store,
        }
    }

    /// Restore persisted metadata at startup. Credentials are absent until
    /// the workflow engine re-registers on activation.
    pub async fn load_all(&self) -> Result<usize, StorageError> {
        let rows = self.store.list_webhooks().await?;
        let count = rows.len();

        let mut hooks = self.hooks.write().expect("registry lock poisoned");
        for row in rows {
            hooks.insert(row.workflow_id.clone(), config_from_row(&row));
        }
        Ok(count)
    }

    /// Register (or replace) a webhook and return its public URL
    pub async fn register(
        &self,
        workflow_id: &str,
        config: WebhookConfig,
    ) -> Result<String, StorageError> {
        let _guard = self.write_lock.lock().await;

        self.store
            .upsert_webhook(&WebhookRow {
                workflow_id: workflow_id.to_string(),
                user_id: config.user_id.clone(),
                method: config.method.as_str().to_string(),
                auth_type: config.auth.type_str().to_string(),
                response_mode: config.response_mode.as_str().to_string(),
                response_template: config.response_template.clone(),
                response_content_type: config.response_content_type.clone(),
                created_at: config.created_at,
            })
            .await?;

        let url = self.trigger_url(workflow_id);
        if self.tunnel().is_none() {
            self.remote_registered
                .write()
                .expect("registry lock poisoned")
                .insert(workflow_id.to_string());
        }

        self.hooks
            .write()
            .expect("registry lock poisoned")
            .insert(workflow_id.to_string(), config);

        log::info!("registered webhook for workflow {} at {}", workflow_id, url);
        Ok(url)
    }

    pub async fn unregister(&self, workflow_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.store.delete_webhook(workflow_id).await?;
        self.hooks
            .write()
            .expect("registry lock poisoned")
            .remove(workflow_id);
        self.remote_registered
            .write()
            .expect("registry lock poisoned")
            .remove(workflow_id);
        Ok(removed)
    }

    pub fn get(&self, workflow_id: &str) -> Option<WebhookConfig> {
        self.hooks
            .read()
            .expect("registry lock poisoned")
            .get(workflow_id)
            .cloned()
    }

    pub fn tunnel(&self) -> Option<String> {
        self.tunnel_url.read().expect("registry lock poisoned").clone()
    }

    pub fn set_tunnel(&self, url: Option<String>) {
        *self.tunnel_url.write().expect("registry lock poisoned") = url;
    }

    pub fn has_remote_registrations(&self) -> bool {
        !self
            .remote_registered
            .read()
            .expect("registry lock poisoned")
            .is_empty()
    }

    /// Public trigger URL: tunnel fastpath when connected, otherwise the
    /// remote aggregator template
    pub fn trigger_url(&self, workflow_id: &str) -> String {
        if let Some(tunnel) = self.tunnel() {
            return format!(
                "{}/webhooks/trigger/{}",
                tunnel.trim_end_matches('/'),
                workflow_id
            );
        }
        match &self.remote_url {
            Some(remote) => format!(
                "{}/webhooks/trigger/{}",
                remote.trim_end_matches('/'),
                workflow_id
            ),
            None => format!("/webhooks/trigger/{}", workflow_id),
        }
    }
}

fn config_from_row(row: &WebhookRow) -> WebhookConfig {
    // Secrets are not persisted; restore the auth *type* with empty
    // credentials so the record authorizes nothing until re-activation
    let auth = match row.auth_type.as_str() {
        "basic" => HookAuth::Basic {
            user: String::new(),
            pass: String::new(),
        },
        "bearer" => HookAuth::Bearer {
            token: String::new(),
        },
        "signed" => HookAuth::Signed {
            token: String::new(),
        },
        _ => HookAuth::None,
    };

    WebhookConfig {
        user_id: row.user_id.clone(),
        method: HookMethod::parse(&row.method).unwrap_or(HookMethod::Any),
        auth,
        response_mode: ResponseMode::parse(&row.response_mode)
            .unwrap_or(ResponseMode::Immediate),
        response_template: row.response_template.clone(),
        response_content_type: row.response_content_type.clone(),
        created_at: row.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry(tunnel: Option<&str>) -> WebhookRegistry {
        let store = Store::in_memory().await.unwrap();
        WebhookRegistry::new(
            store,
            tunnel.map(|s| s.to_string()),
            Some("https://relay.example.com".to_string()),
        )
    }

    #[tokio::test]
    async fn register_prefers_tunnel_url() {
        let reg = registry(Some("https://abc123.tunnel.dev")).await;
        let url = reg
            .register("wf-1", WebhookConfig::new("u1", HookMethod::Post))
            .await
            .unwrap();
        assert_eq!(url, "https://abc123.tunnel.dev/webhooks/trigger/wf-1");
        assert!(!reg.has_remote_registrations());
    }

    #[tokio::test]
    async fn register_without_tunnel_uses_remote_template() {
        let reg = registry(None).await;
        let url = reg
            .register("wf-2", WebhookConfig::new("u1", HookMethod::Any))
            .await
            .unwrap();
        assert_eq!(url, "https://relay.example.com/webhooks/trigger/wf-2");
        assert!(reg.has_remote_registrations());
    }

    #[tokio::test]
    async fn unregister_removes_map_and_row() {
        let reg = registry(None).await;
        reg.register("wf-3", WebhookConfig::new("u1", HookMethod::Get))
            .await
            .unwrap();
        assert!(reg.get("wf-3").is_some());

        assert!(reg.unregister("wf-3").await.unwrap());
        assert!(reg.get("wf-3").is_none());
        assert!(!reg.has_remote_registrations());
    }

    #[tokio::test]
    async fn load_all_restores_metadata_without_secrets() {
        let store = Store::in_memory().await.unwrap();
        let reg = WebhookRegistry::new(store.clone(), None, None);

        let mut config = WebhookConfig::new("u1", HookMethod::Post);
        config.auth = HookAuth::Bearer {
            token: "secret-token".to_string(),
        };
        reg.register("wf-4", config).await.unwrap();

        // Fresh registry over the same store simulates a restart
        let restarted = WebhookRegistry::new(store, None, None);
        assert_eq!(restarted.load_all().await.unwrap(), 1);

        let restored = restarted.get("wf-4").unwrap();
        assert_eq!(
            restored.auth,
            HookAuth::Bearer {
                token: String::new()
            },
            "credentials must not survive a restart"
        );
    }

    #[test]
    fn method_matching() {
        assert!(HookMethod::Any.accepts("DELETE"));
        assert!(HookMethod::Post.accepts("post"));
        assert!(!HookMethod::Post.accepts("GET"));
    }
}
