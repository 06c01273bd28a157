// External chat bridge.
// Inbound platform messages fan in here: pairing commands are redeemed,
// linked accounts get a streamed model turn whose deltas flow through a
// per-recipient ResponseBuffer back to the platform.

use futures::StreamExt;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::buffer::{send_fn, BufferOptions, ResponseBuffer};
use super::pairing::{PairingError, PairingService};
use super::telegram::TelegramClient;
use crate::llm::{
    AdapterFactory, CallContext, CancelToken, Message, Orchestrator, StreamChunk, Tool,
    ToolExecutor, TurnOptions,
};
use crate::storage::{ExternalAccountRow, StorageError, Store};

/// How much history each external conversation carries into a turn
const HISTORY_LIMIT: i64 = 50;

const ONBOARDING_HINT: &str = "This chat isn't linked to an account yet. Generate a pairing \
     code in the app, then send it here as: /pair <CODE>";

/// Model backend an external conversation runs against
#[derive(Clone)]
pub struct ChatBackend {
    pub factory: Arc<AdapterFactory>,
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<Tool>,
    pub executor: ToolExecutor,
}

/// Service status surfaced over HTTP
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatStatus {
    pub configured: bool,
    pub active: bool,
    pub webhook_url: Option<String>,
}

pub struct ExternalChatService {
    store: Store,
    pairing: PairingService,
    backend: ChatBackend,
    orchestrator: Orchestrator,
    telegram: Option<TelegramClient>,
    webhook_secret: Option<String>,
    public_url: Option<String>,
}

impl ExternalChatService {
    pub fn new(
        store: Store,
        backend: ChatBackend,
        telegram: Option<TelegramClient>,
        webhook_secret: Option<String>,
        public_url: Option<String>,
    ) -> Self {
        Self {
            pairing: PairingService::new(store.clone()),
            store,
            backend,
            orchestrator: Orchestrator::new(TurnOptions::default()),
            telegram,
            webhook_secret,
            public_url,
        }
    }

    pub fn pairing(&self) -> &PairingService {
        &self.pairing
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }

    pub fn status(&self) -> ChatStatus {
        let configured = self.telegram.is_some();
        let webhook_url = self
            .public_url
            .as_ref()
            .map(|base| format!("{}/external-chat/telegram/webhook", base.trim_end_matches('/')));
        ChatStatus {
            configured,
            active: configured && webhook_url.is_some(),
            webhook_url,
        }
    }

    pub async fn list_accounts(&self, user_id: &str) -> Result<Vec<ExternalAccountRow>, StorageError> {
        self.store.list_external_accounts(user_id).await
    }

    pub async fn delete_account(&self, user_id: &str, id: i64) -> Result<bool, StorageError> {
        self.store.delete_external_account(id, user_id).await
    }

    /// Handle one inbound platform message end to end, including replies
    pub async fn handle_inbound(
        &self,
        platform: &str,
        external_id: &str,
        chat_id: i64,
        username: Option<&str>,
        text: &str,
    ) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if let Some(code) = text.strip_prefix("/pair") {
            let reply = self
                .redeem_reply(code.trim(), platform, external_id, username)
                .await;
            self.send(chat_id, &reply).await;
            return;
        }
        if text == "/start" {
            self.send(chat_id, ONBOARDING_HINT).await;
            return;
        }

        let account = match self.store.get_external_account(platform, external_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.send(chat_id, ONBOARDING_HINT).await;
                return;
            }
            Err(err) => {
                log::error!("account lookup failed: {}", err);
                return;
            }
        };

        if let Err(err) = self.run_conversation(&account, platform, external_id, chat_id, text).await
        {
            log::error!("external chat turn failed: {}", err);
            self.send(chat_id, "Something went wrong handling that message.")
                .await;
        }
    }

    async fn redeem_reply(
        &self,
        code: &str,
        platform: &str,
        external_id: &str,
        username: Option<&str>,
    ) -> String {
        if code.is_empty() {
            return "Usage: /pair <CODE>".to_string();
        }

        let redemption = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            self.pairing.redeem(code, platform, external_id, username),
        )
        .await;

        let Ok(outcome) = redemption else {
            log::warn!("pairing redemption exceeded its deadline");
            return "Pairing is temporarily unavailable. Try again later.".to_string();
        };

        match outcome {
            Ok(_) => "Account linked. You can start chatting now.".to_string(),
            Err(PairingError::AlreadyLinked) => {
                "This chat is already linked to an account.".to_string()
            }
            Err(err @ PairingError::Storage(_)) => {
                log::error!("pairing redemption failed: {}", err);
                "Pairing is temporarily unavailable. Try again later.".to_string()
            }
            Err(err) => format!("Pairing failed: {}.", err),
        }
    }

    /// Stream one model turn into the recipient's ResponseBuffer
    async fn run_conversation(
        &self,
        account: &ExternalAccountRow,
        platform: &str,
        external_id: &str,
        chat_id: i64,
        text: &str,
    ) -> Result<(), StorageError> {
        let conversation_key = format!("external-{}-{}", platform, external_id);

        let mut history = Vec::new();
        if let Some(system) = &self.backend.system_prompt {
            history.push(Message::system(system.clone()));
        }
        history.extend(self.store.load_conversation(&conversation_key, HISTORY_LIMIT).await?);

        let user_message = Message::user(text);
        history.push(user_message.clone());
        self.store
            .append_conversation(&conversation_key, &user_message)
            .await?;
        self.store.touch_last_message(account.id).await?;

        let adapter = match self
            .backend
            .factory
            .adapter_for(&self.backend.provider, &self.backend.model)
        {
            Ok(adapter) => adapter,
            Err(err) => {
                log::error!("no adapter for external chat: {}", err);
                self.send(chat_id, "The assistant is not configured correctly.")
                    .await;
                return Ok(());
            }
        };

        let buffer = self.make_buffer(chat_id);

        // Bridge the synchronous chunk callback into the async buffer while
        // preserving delta order: a single consumer drains the channel.
        let (delta_tx, delta_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let pump = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut deltas = UnboundedReceiverStream::new(delta_rx);
                while let Some(delta) = deltas.next().await {
                    buffer.add(&delta).await;
                }
            })
        };

        let on_chunk = move |chunk: StreamChunk| {
            if let StreamChunk::Content(delta) = chunk {
                let _ = delta_tx.send(delta);
            }
        };

        let ctx = CallContext {
            cancel: CancelToken::none(),
            ..Default::default()
        };

        let outcome = self
            .orchestrator
            .run_turn(
                adapter.as_ref(),
                &history,
                &self.backend.tools,
                &self.backend.executor,
                &on_chunk,
                &ctx,
            )
            .await;

        // Close the stream, drain the pump, then flush the tail
        drop(on_chunk);
        let _ = pump.await;
        buffer.flush().await;

        // Streaming already delivered the content; recoveries and
        // non-streaming fallbacks may still need an explicit send
        if outcome.recovered && !outcome.final_text.is_empty() {
            self.send(chat_id, &outcome.final_text).await;
        }

        for message in &outcome.appended {
            self.store
                .append_conversation(&conversation_key, message)
                .await?;
        }

        Ok(())
    }

    fn make_buffer(&self, chat_id: i64) -> ResponseBuffer {
        let telegram = self.telegram.clone();
        ResponseBuffer::new(
            send_fn(move |text: String| {
                let telegram = telegram.clone();
                async move {
                    match telegram {
                        Some(client) => client.send_message(chat_id, &text).await,
                        None => {
                            log::warn!("telegram not configured; dropping outbound message");
                            Ok(())
                        }
                    }
                }
            }),
            BufferOptions::default(),
        )
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Some(telegram) = &self.telegram {
            if let Err(err) = telegram.send_message(chat_id, text).await {
                log::warn!("telegram send failed: {}", err);
            }
        }
    }
}
