// External chat bridge: pairing codes, inbound message fan-in, streamed
// response buffering and rate-safe fan-out to messaging platforms.

pub mod buffer;
pub mod pairing;
pub mod routes;
pub mod service;
pub mod telegram;

pub use buffer::{send_fn, split_message, BufferOptions, ResponseBuffer, SendFn};
pub use pairing::{IssuedCode, PairingError, PairingService, PAIRING_ALPHABET};
pub use routes::{router as chat_router, ChatState};
pub use service::{ChatBackend, ChatStatus, ExternalChatService};
pub use telegram::{verify_webhook_secret, TelegramClient, TelegramUpdate};
