//! In-memory doubles for the engine's four consumed capabilities (§6.1), used by
//! the crate's own test suite and suitable for single-process embedding.
//!
//! Grounded on `batcher/src/storage/in_memory.rs` (`parking_lot::RwLock<HashMap<...>>`
//! store, atomic claim/persist) and `batcher/src/http.rs`'s `MockHttpClient`
//! (per-key FIFO response queue, call recording).

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::event::{EventStatus, WebhookEvent};
use crate::repo::{HttpClient, WebhookEventRepo, WebhookRepo, WebhookStateRepo};
use crate::types::{EventKey, HttpRequest, HttpResponse, WebhookId};
use crate::webhook::{Webhook, WebhookStatus};

/// A fixed registry of webhooks, populated once at construction. The spec treats
/// webhook registration itself as out of the engine's scope (§1), so this double
/// offers no mutation beyond what the constructor takes.
pub struct InMemoryWebhookRepo {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookRepo {
    pub fn new(webhooks: impl IntoIterator<Item = Webhook>) -> Self {
        let webhooks = webhooks.into_iter().map(|w| (w.id, w)).collect();
        Self { webhooks: RwLock::new(webhooks) }
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn get(&self, id: WebhookId) -> anyhow::Result<Option<Webhook>> {
        Ok(self.webhooks.read().get(&id).cloned())
    }
}

struct StoredEvent {
    event: WebhookEvent,
}

/// In-memory event store with a broadcast-backed new-event stream, mirroring the
/// shape `WebhookEventRepo::subscribe_to_new_events` asks any embedder to provide.
pub struct InMemoryEventRepo {
    events: RwLock<HashMap<EventKey, StoredEvent>>,
    new_events_tx: broadcast::Sender<WebhookEvent>,
}

impl InMemoryEventRepo {
    pub fn new() -> Self {
        let (new_events_tx, _rx) = broadcast::channel(1024);
        Self { events: RwLock::new(HashMap::new()), new_events_tx }
    }

    pub fn get(&self, key: EventKey) -> Option<WebhookEvent> {
        self.events.read().get(&key).map(|s| s.event.clone())
    }
}

impl Default for InMemoryEventRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookEventRepo for InMemoryEventRepo {
    async fn create_event(&self, event: WebhookEvent) -> anyhow::Result<()> {
        self.events.write().insert(event.key, StoredEvent { event: event.clone() });
        // A lagging/absent subscriber must never block ingestion; broadcast never
        // blocks the sender, it only drops for slow receivers.
        let _ = self.new_events_tx.send(event);
        Ok(())
    }

    async fn set_event_status(&self, key: EventKey, status: EventStatus) -> anyhow::Result<()> {
        let mut events = self.events.write();
        let stored = events.get_mut(&key).ok_or_else(|| anyhow::anyhow!("unknown event {key}"))?;
        stored.event.status = status;
        Ok(())
    }

    async fn events_by_status(
        &self,
        statuses: &[EventStatus],
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<WebhookEvent>> + Send>>> {
        let matching: Vec<anyhow::Result<WebhookEvent>> = self
            .events
            .read()
            .values()
            .filter(|stored| statuses.contains(&stored.event.status))
            .map(|stored| Ok(stored.event.clone()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(matching)))
    }

    fn subscribe_to_new_events(&self) -> Pin<Box<dyn Stream<Item = WebhookEvent> + Send>> {
        let rx = self.new_events_tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok()))
    }
}

/// In-memory webhook status store with a broadcast-backed update stream, standing
/// in for an operator admin UI re-enabling a webhook out of band.
pub struct InMemoryStateRepo {
    statuses: RwLock<HashMap<WebhookId, WebhookStatus>>,
    updates_tx: broadcast::Sender<(WebhookId, WebhookStatus)>,
}

impl InMemoryStateRepo {
    pub fn new() -> Self {
        let (updates_tx, _rx) = broadcast::channel(256);
        Self { statuses: RwLock::new(HashMap::new()), updates_tx }
    }

    /// Simulate an out-of-band operator write (e.g. via an admin UI), distinct from
    /// the engine's own `set_status` path, so tests can exercise `subscribe_to_updates`.
    pub fn operator_set_status(&self, id: WebhookId, status: WebhookStatus) {
        self.statuses.write().insert(id, status);
        let _ = self.updates_tx.send((id, status));
    }

    /// Non-async status read, for tests polling status transitions from outside
    /// any particular `tokio::test` task.
    pub fn get_status_sync(&self, id: WebhookId) -> Option<WebhookStatus> {
        self.statuses.read().get(&id).copied()
    }
}

impl Default for InMemoryStateRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookStateRepo for InMemoryStateRepo {
    async fn get_status(&self, id: WebhookId) -> anyhow::Result<Option<WebhookStatus>> {
        Ok(self.statuses.read().get(&id).copied())
    }

    async fn set_status(&self, id: WebhookId, status: WebhookStatus) -> anyhow::Result<()> {
        self.statuses.write().insert(id, status);
        let _ = self.updates_tx.send((id, status));
        Ok(())
    }

    fn subscribe_to_updates(&self) -> Pin<Box<dyn Stream<Item = (WebhookId, WebhookStatus)> + Send>> {
        let rx = self.updates_tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok()))
    }
}

/// Record of one call made to [`MockHttpClient`].
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// A queue of canned responses keyed by URL, returned in FIFO order; a URL with no
/// queued response yields a connection-failure-shaped error.
pub struct MockHttpClient {
    responses: Mutex<HashMap<String, VecDeque<anyhow::Result<HttpResponse>>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self { responses: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    pub fn queue_response(&self, url: impl Into<String>, response: HttpResponse) {
        self.responses.lock().entry(url.into()).or_default().push_back(Ok(response));
    }

    pub fn queue_failure(&self, url: impl Into<String>, message: impl Into<String>) {
        self.responses.lock().entry(url.into()).or_default().push_back(Err(anyhow::anyhow!(message.into())));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.calls.lock().push(MockCall { url: request.url.clone(), headers: request.headers.clone(), body: request.body.clone() });

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&request.url) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Err(anyhow::anyhow!("no mock response queued for {}", request.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_http_client_returns_queued_responses_fifo() {
        let mock = MockHttpClient::new();
        mock.queue_response("https://example.test/hook", HttpResponse { status: 200 });
        mock.queue_response("https://example.test/hook", HttpResponse { status: 500 });

        let request = |body: &str| HttpRequest { url: "https://example.test/hook".to_string(), headers: vec![], body: body.to_string() };

        let first = mock.send(request("a")).await.unwrap();
        let second = mock.send(request("b")).await.unwrap();
        assert_eq!(first.status, 200);
        assert_eq!(second.status, 500);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_http_client_errors_when_no_response_queued() {
        let mock = MockHttpClient::new();
        let result = mock.send(HttpRequest { url: "https://example.test/unknown".to_string(), headers: vec![], body: String::new() }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn event_repo_create_then_set_status_round_trips() {
        use crate::event::Headers;
        use crate::types::EventId;

        let repo = InMemoryEventRepo::new();
        let key = EventKey::new(EventId(1), WebhookId(1));
        let event = WebhookEvent::new(key, WebhookId(1), "payload", Headers::new());
        repo.create_event(event).await.unwrap();

        repo.set_event_status(key, EventStatus::Delivered).await.unwrap();
        assert_eq!(repo.get(key).unwrap().status, EventStatus::Delivered);
    }
}
