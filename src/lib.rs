pub mod chat;
pub mod config;
pub mod llm;
pub mod logger;
pub mod storage;
pub mod webhooks;

// Re-export commonly used items for convenience
pub use chat::{ExternalChatService, ResponseBuffer, TelegramClient};
pub use config::Config;
pub use llm::{AdapterFactory, Message, Orchestrator, ProviderAdapter, Role, Tool, ToolCall};
pub use storage::Store;
pub use webhooks::{WebhookDispatcher, WebhookRegistry, WorkflowEngine};
