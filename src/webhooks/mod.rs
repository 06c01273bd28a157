// Webhook trigger pipeline: registry, dispatcher (push + remote poll),
// response templates and the public HTTP surface.

pub mod dispatcher;
pub mod registry;
pub mod routes;
pub mod template;

pub use dispatcher::{
    constant_time_eq, EngineError, HookResponse, TriggerEnvelope, WebhookDispatcher,
    WorkflowEngine,
};
pub use registry::{HookAuth, HookMethod, ResponseMode, WebhookConfig, WebhookRegistry};
pub use routes::{router as webhook_router, WebhookState};
