//! Core identifiers and wire types shared across the dispatch engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::WebhookEvent;

/// Identifier for a registered webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub u64);

impl From<u64> for WebhookId {
    fn from(id: u64) -> Self {
        WebhookId(id)
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an event, unique within its webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        EventId(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique key for an event: the pair (event id, webhook id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub event_id: EventId,
    pub webhook_id: WebhookId,
}

impl EventKey {
    pub fn new(event_id: EventId, webhook_id: WebhookId) -> Self {
        Self { event_id, webhook_id }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_id, self.webhook_id)
    }
}

/// Whether a webhook receives events one at a time or grouped into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Batching {
    Single,
    Batched,
}

/// Whether a webhook's failed deliveries are retried or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Semantics {
    AtMostOnce,
    AtLeastOnce,
}

/// The four-way delivery contract chosen per webhook, immutable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub batching: Batching,
    pub semantics: Semantics,
}

impl DeliveryMode {
    pub const fn new(batching: Batching, semantics: Semantics) -> Self {
        Self { batching, semantics }
    }

    pub const SINGLE_AT_MOST_ONCE: Self = Self::new(Batching::Single, Semantics::AtMostOnce);
    pub const SINGLE_AT_LEAST_ONCE: Self = Self::new(Batching::Single, Semantics::AtLeastOnce);
    pub const BATCHED_AT_MOST_ONCE: Self = Self::new(Batching::Batched, Semantics::AtMostOnce);
    pub const BATCHED_AT_LEAST_ONCE: Self = Self::new(Batching::Batched, Semantics::AtLeastOnce);

    pub fn is_batched(&self) -> bool {
        matches!(self.batching, Batching::Batched)
    }

    pub fn is_at_least_once(&self) -> bool {
        matches!(self.semantics, Semantics::AtLeastOnce)
    }
}

/// A single HTTP header, ordered and possibly repeated (see [`crate::event::Headers`]).
pub type Header = (String, String);

/// An outgoing HTTP request built by the dispatcher. Ephemeral: never persisted.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<Header>,
    pub body: String,
}

/// The outcome of submitting an [`HttpRequest`] to the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
}

impl HttpResponse {
    /// Success is status in [200, 299].
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The grouping key for batched delivery: (webhook, content-type, accept).
///
/// Two events for the same webhook batch together only if their `Content-Type`
/// and `Accept` headers (case-sensitive, as supplied) match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub webhook_id: WebhookId,
    pub content_type: Option<String>,
    pub accept: Option<String>,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.webhook_id,
            self.content_type.as_deref().unwrap_or("-"),
            self.accept.as_deref().unwrap_or("-")
        )
    }
}

/// The unit of work handed to the Dispatcher: one event (Single mode) or an
/// ordered group of events sharing a webhook and BatchKey (Batched mode).
///
/// `from_retry` distinguishes a fresh dispatch (its first attempt, routed from
/// the subscription loop or the Batcher) from one the Retry Controller itself
/// submitted: the Dispatcher uses it to decide whether a failure should create
/// a new retry queue (`enqueue`) or report back into an existing one
/// (`report_outcome`), never both for the same failed attempt.
///
/// `batched` records whether this unit came from a `Batched`-mode webhook,
/// independent of `events.len()`: a timer-triggered batch can legitimately
/// contain a single event, and it must still be dispatched with a JSON-array
/// body and the BatchKey's shared headers per spec.md §6.2, not the single-event
/// wire format.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub webhook_id: WebhookId,
    pub events: Vec<WebhookEvent>,
    pub from_retry: bool,
    pub batched: bool,
}

impl Dispatch {
    pub fn single(webhook_id: WebhookId, event: WebhookEvent) -> Self {
        Self { webhook_id, events: vec![event], from_retry: false, batched: false }
    }

    pub fn batch(webhook_id: WebhookId, events: Vec<WebhookEvent>) -> Self {
        Self { webhook_id, events, from_retry: false, batched: true }
    }

    /// A dispatch the Retry Controller is resubmitting. `batched` carries the
    /// owning webhook's `Batching` so the wire format matches what it would have
    /// been on a fresh attempt, regardless of how many events ended up queued.
    pub fn retry(webhook_id: WebhookId, events: Vec<WebhookEvent>, batched: bool) -> Self {
        Self { webhook_id, events, from_retry: true, batched }
    }

    pub fn is_batch(&self) -> bool {
        self.batched
    }
}
