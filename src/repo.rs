//! External capability traits (§6.1): the seams through which the engine talks to
//! durable storage and the network. Concrete implementations are supplied by the
//! embedder; see `src/testing.rs` for in-memory doubles and `src/main.rs` for the
//! production wiring.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::event::{EventStatus, WebhookEvent};
use crate::types::{EventKey, HttpRequest, HttpResponse, WebhookId};
use crate::webhook::{Webhook, WebhookStatus};

/// Lookup of registered webhooks. The engine never creates, edits, or deletes
/// webhooks itself — that is entirely the embedder's concern — it only reads.
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn get(&self, id: WebhookId) -> anyhow::Result<Option<Webhook>>;
}

/// Durable storage for events and their delivery status. The engine's two entry
/// points into this trait are `subscribe_to_new_events` (the live stream driving
/// the Subscription Loop) and `events_by_status` (used once, at startup, to replay
/// events left `Delivering` by a prior crash — see spec.md §9 "Non-goals": the core
/// relies on this replay rather than implementing its own crash journal).
#[async_trait]
pub trait WebhookEventRepo: Send + Sync {
    async fn create_event(&self, event: WebhookEvent) -> anyhow::Result<()>;
    async fn set_event_status(&self, key: EventKey, status: EventStatus) -> anyhow::Result<()>;

    /// Events currently in one of `statuses`, for startup replay of non-terminal work.
    async fn events_by_status(
        &self,
        statuses: &[EventStatus],
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<WebhookEvent>> + Send>>>;

    /// The live stream of newly created events, from the point of subscription.
    fn subscribe_to_new_events(&self) -> Pin<Box<dyn Stream<Item = WebhookEvent> + Send>>;
}

/// Durable storage for webhook status, and the channel through which an operator's
/// out-of-band re-enable becomes visible to the engine.
///
/// `subscribe_to_updates` returning a stream (rather than a poll method) mirrors
/// `fusillade`'s `Storage::get_request_updates` signature: the embedder is free to
/// back it with a DB LISTEN/NOTIFY channel, a polling loop, or — as in the in-memory
/// double — a `tokio::sync::broadcast` receiver wrapped as a stream.
#[async_trait]
pub trait WebhookStateRepo: Send + Sync {
    async fn get_status(&self, id: WebhookId) -> anyhow::Result<Option<WebhookStatus>>;
    async fn set_status(&self, id: WebhookId, status: WebhookStatus) -> anyhow::Result<()>;

    /// A stream of `(webhook_id, new_status)` pairs for changes made by parties
    /// other than this engine instance (e.g. an operator re-enabling a webhook
    /// through an admin UI). The engine only needs to react to re-enables; other
    /// transitions on the stream are harmless to observe but ignored.
    fn subscribe_to_updates(
        &self,
    ) -> Pin<Box<dyn Stream<Item = (WebhookId, WebhookStatus)> + Send>>;
}

/// The engine's sole outbound network capability. A real implementation wraps
/// `reqwest`; tests substitute `testing::MockHttpClient`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}
