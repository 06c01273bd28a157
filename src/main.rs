use clap::Parser;
use std::sync::Arc;

use agent_relay::chat::{chat_router, ChatBackend, ChatState, ExternalChatService, TelegramClient};
use agent_relay::config::Config;
use agent_relay::llm::{executor_fn, AdapterFactory, CancelToken, ToolCall};
use agent_relay::storage::Store;
use agent_relay::webhooks::{
    webhook_router, EngineError, TriggerEnvelope, WebhookDispatcher, WebhookRegistry,
    WebhookState, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(author, version, about = "Agent runtime bridging chats, webhooks and LLM providers", long_about = None)]
struct Cli {
    /// Port to serve HTTP on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// SQLite database path
    #[arg(long, default_value = "agent-relay.db")]
    db: String,

    /// Provider id for external chat conversations
    #[arg(long, default_value = "openai")]
    provider: String,

    /// Model id for external chat conversations
    #[arg(long, default_value = "gpt-4o")]
    model: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Stand-in engine that completes every trigger with its own body. Host
/// applications embedding the library inject their real engine instead.
struct EchoEngine;

#[async_trait::async_trait]
impl WorkflowEngine for EchoEngine {
    fn is_ready(&self, _workflow_id: &str) -> bool {
        true
    }

    async fn dispatch(
        &self,
        trigger: TriggerEnvelope,
    ) -> Result<tokio::sync::oneshot::Receiver<serde_json::Value>, EngineError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(trigger.body);
        Ok(rx)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    agent_relay::logger::init(if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    let config = Config::from_env();
    let store = Store::connect(&format!("sqlite://{}", cli.db)).await?;

    // Webhook pipeline
    let registry = Arc::new(WebhookRegistry::new(
        store.clone(),
        config.tunnel_url.clone(),
        config.remote_url.clone(),
    ));
    let restored = registry.load_all().await?;
    log::info!("restored {} webhook registration(s)", restored);

    let dispatcher = Arc::new(WebhookDispatcher::new(
        registry.clone(),
        Arc::new(EchoEngine),
        config.remote_url.clone(),
    ));

    // External chat bridge
    let telegram = config
        .telegram_bot_token
        .as_ref()
        .map(|token| TelegramClient::new(token.clone()));
    let backend = ChatBackend {
        factory: Arc::new(AdapterFactory::new(config.provider_keys.clone())),
        provider: cli.provider,
        model: cli.model,
        system_prompt: None,
        tools: Vec::new(),
        executor: executor_fn(|call: ToolCall| async move {
            Err(format!("no executor registered for tool '{}'", call.name))
        }),
    };
    let chat_service = Arc::new(ExternalChatService::new(
        store,
        backend,
        telegram,
        config.telegram_webhook_secret.clone(),
        config.tunnel_url.clone(),
    ));

    let app = axum::Router::new()
        .merge(webhook_router(WebhookState {
            dispatcher: dispatcher.clone(),
        }))
        .merge(chat_router(ChatState {
            service: chat_service,
        }))
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // Remote poll loop runs until shutdown
    let (shutdown_handle, shutdown_token) = CancelToken::pair();
    let poll_task = tokio::spawn(dispatcher.clone().run_poll_loop(shutdown_token));

    let addr = format!("0.0.0.0:{}", cli.port);
    log::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received");
        })
        .await?;

    shutdown_handle.cancel();
    let _ = poll_task.await;
    Ok(())
}
