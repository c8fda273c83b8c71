//! Drives the HTTP client for a [`Dispatch`] unit, classifies the outcome, and
//! routes it to the event repo and (for `AtLeastOnce` webhooks) the Retry Controller.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::{DispatchErrorEvent, ErrorChannel};
use crate::event::{EventStatus, WebhookEvent};
use crate::repo::{HttpClient, WebhookEventRepo, WebhookRepo};
use crate::retry::{DispatchOutcome, RetryController};
use crate::types::{Dispatch, HttpRequest, WebhookId};

/// Caps the number of dispatches in flight at once across the whole engine. Per
/// spec.md §5, parallelism across webhooks is unbounded by design; this bound exists
/// only to keep a pathological fan-out from exhausting file descriptors, the way
/// `fusillade`'s daemon caps in-flight work per model via a semaphore rather than
/// leaving it unbounded.
const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Architecture: callers push [`Dispatch`] units onto `dispatch_tx`; a single
/// `run` task receives them and spawns one send task per unit, gated by a
/// semaphore. Each send task builds the request, submits it to the `HttpClient`,
/// classifies the response, persists event status, and — on failure for an
/// `AtLeastOnce` webhook — hands the events to the [`RetryController`].
///
/// Grounded near-verbatim on `dwctl/src/webhooks/dispatcher.rs`'s `WebhookDispatcher`:
/// the same mpsc-in/semaphore-gated-spawn/classify shape, generalized from a fixed
/// success/failure outcome to also emitting retry-controller feedback.
pub struct Dispatcher<W, E, H, S>
where
    W: WebhookRepo,
    E: WebhookEventRepo,
    H: HttpClient,
    S: crate::repo::WebhookStateRepo + 'static,
{
    webhook_repo: Arc<W>,
    event_repo: Arc<E>,
    http: Arc<H>,
    retry: Arc<RetryController<S>>,
    errors: ErrorChannel,
    permits: Arc<Semaphore>,
}

impl<W, E, H, S> Dispatcher<W, E, H, S>
where
    W: WebhookRepo + 'static,
    E: WebhookEventRepo + 'static,
    H: HttpClient + 'static,
    S: crate::repo::WebhookStateRepo + 'static,
{
    pub fn new(
        webhook_repo: Arc<W>,
        event_repo: Arc<E>,
        http: Arc<H>,
        retry: Arc<RetryController<S>>,
        errors: ErrorChannel,
    ) -> Self {
        Self { webhook_repo, event_repo, http, retry, errors, permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)) }
    }

    /// Receive [`Dispatch`] units from `rx` until the channel closes or `shutdown`
    /// fires, spawning one bounded send task per unit. Returns once every spawned
    /// task has been awaited (drain).
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Dispatch>, shutdown: CancellationToken) {
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                maybe_dispatch = rx.recv() => {
                    match maybe_dispatch {
                        Some(dispatch) => {
                            let this = self.clone();
                            in_flight.spawn(async move { this.send(dispatch).await });
                        }
                        None => break,
                    }
                }
            }
        }

        // `shutdown` is checked ahead of `rx.recv()` above (the loop is `biased`
        // toward prompt exit), so cancellation can win a poll even when the
        // Batcher's shutdown flush (§5(b)) already landed units on `rx` moments
        // earlier — those would otherwise be abandoned unread, leaving their
        // events stuck `New` forever. Drain whatever is already queued,
        // non-blocking, before starting the join drain below.
        while let Ok(dispatch) = rx.try_recv() {
            let this = self.clone();
            in_flight.spawn(async move { this.send(dispatch).await });
        }

        // Drain in-flight sends; shutdown's drain deadline is enforced by the caller
        // racing this future against a timeout and abandoning the JoinSet if it fires.
        while in_flight.join_next().await.is_some() {}
    }

    /// Send a single [`Dispatch`] unit: mark delivering, build the request, submit,
    /// classify, and route the outcome.
    async fn send(&self, dispatch: Dispatch) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        for event in &dispatch.events {
            if let Err(err) = self.event_repo.set_event_status(event.key, EventStatus::Delivering).await {
                self.errors.publish(DispatchErrorEvent::new(Some(dispatch.webhook_id), crate::errors::DispatchError::repo(err)));
            }
        }

        let webhook = match self.webhook_repo.get(dispatch.webhook_id).await {
            Ok(Some(webhook)) => webhook,
            Ok(None) => {
                self.errors.publish(DispatchErrorEvent::new(
                    Some(dispatch.webhook_id),
                    crate::errors::DispatchError::MissingWebhook(dispatch.webhook_id),
                ));
                return;
            }
            Err(err) => {
                self.errors.publish(DispatchErrorEvent::new(Some(dispatch.webhook_id), crate::errors::DispatchError::repo(err)));
                return;
            }
        };

        let request = build_request(&webhook.url, &dispatch.events, dispatch.is_batch());
        let outcome = self.http.send(request).await;

        let succeeded = match &outcome {
            Ok(response) => response.is_success(),
            Err(_) => false,
        };

        for event in &dispatch.events {
            let status = if succeeded { EventStatus::Delivered } else { EventStatus::Failed };
            if let Err(err) = self.event_repo.set_event_status(event.key, status).await {
                self.errors.publish(DispatchErrorEvent::new(Some(dispatch.webhook_id), crate::errors::DispatchError::repo(err)));
            }
        }

        if let Err(cause) = &outcome {
            tracing::warn!(webhook_id = %dispatch.webhook_id, error = %cause, "dispatch failed");
        }

        counter!("dispatch_deliveries_total", "outcome" => if succeeded { "success" } else { "failure" })
            .increment(dispatch.events.len() as u64);

        // A fresh (non-retry) failure creates or joins the webhook's retry queue;
        // an attempt the Retry Controller itself submitted reports back into the
        // queue it came from instead. Never both for the same attempt — that
        // would requeue the same events twice (once via `enqueue`'s extend, once
        // via `report_outcome`'s requeue-at-head).
        if dispatch.from_retry {
            self.retry
                .report_outcome(DispatchOutcome { webhook_id: dispatch.webhook_id, succeeded }, if succeeded { Vec::new() } else { dispatch.events })
                .await;
        } else if !succeeded && webhook.delivery_mode.is_at_least_once() {
            self.retry.enqueue(dispatch.webhook_id, webhook.delivery_mode.batching, dispatch.events).await;
        }
    }
}

/// Build the outgoing HTTP request for a dispatch unit per spec.md §6.2: a single
/// event's content verbatim, or a JSON array of contents for a batch, with headers
/// taken from the event (single) or the batch key's shared `Content-Type`/`Accept`
/// (batched). Dispatched from `Batched`-mode webhooks, `batched` is always true even
/// when exactly one event made it into the batch — the wire format follows the
/// webhook's delivery mode, not the incidental queue length at emission time.
fn build_request(url: &str, events: &[WebhookEvent], batched: bool) -> HttpRequest {
    if !batched {
        let event = &events[0];
        HttpRequest { url: url.to_string(), headers: event.headers.0.clone(), body: event.content.clone() }
    } else {
        let bodies: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        let body = serde_json::to_string(&bodies).unwrap_or_else(|_| "[]".to_string());

        let mut headers = Vec::new();
        if let Some(first) = events.first() {
            if let Some(ct) = first.headers.content_type() {
                headers.push(("Content-Type".to_string(), ct.to_string()));
            }
            if let Some(accept) = first.headers.accept() {
                headers.push(("Accept".to_string(), accept.to_string()));
            }
        }
        HttpRequest { url: url.to_string(), headers, body }
    }
}
