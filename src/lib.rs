//! A dispatch engine for delivering webhook events.
//!
//! The engine turns newly-created events into outgoing HTTP requests while
//! honouring each webhook's delivery mode (single or batched, at-most-once or
//! at-least-once), its batching window, its retry/backoff schedule, and its
//! `Enabled -> Retrying -> Unavailable` state machine. It owns none of its own
//! durable storage or HTTP transport — those are supplied by the embedder through
//! the traits in [`repo`] — and exposes a single entry point, [`engine::Engine`].
//!
//! ```ignore
//! let engine = Engine::start(webhook_repo, event_repo, state_repo, http, EngineConfig::default()).await?;
//! let mut errors = engine.errors();
//! // ... feed events into event_repo.create_event(...) ...
//! engine.shutdown().await;
//! ```

pub mod batcher;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod event;
pub mod fingerprint;
pub mod http_client;
pub mod repo;
pub mod retry;
pub mod subscription;
pub mod testing;
pub mod types;
pub mod webhook;

pub use engine::{Engine, EngineConfig};
pub use errors::{DispatchError, DispatchErrorEvent, Result};
pub use event::{EventStatus, Headers, WebhookEvent};
pub use http_client::ReqwestHttpClient;
pub use repo::{HttpClient, WebhookEventRepo, WebhookRepo, WebhookStateRepo};
pub use types::{Batching, DeliveryMode, EventId, EventKey, Semantics, WebhookId};
pub use webhook::{Webhook, WebhookStatus};
