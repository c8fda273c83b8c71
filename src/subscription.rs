//! The top-level pipeline (§4.1): merges the new-event stream with startup replay
//! of crash-recovered events, resolves each event's webhook, and routes it to the
//! Batcher or Dispatcher by delivery mode.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batcher::Batcher;
use crate::errors::{DispatchError, DispatchErrorEvent, ErrorChannel};
use crate::event::{EventStatus, WebhookEvent};
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::retry::RetryController;
use crate::types::{Batching, Dispatch};
use crate::webhook::{WebhookStateCache, WebhookStatus};

/// Drain deadline and error-channel buffer size — the two knobs the Lifecycle &
/// Shutdown component (§4.7 of SPEC_FULL.md) exposes.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub drain_deadline: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { drain_deadline: Duration::from_secs(30) }
    }
}

/// A running subscription loop. `shutdown` stops intake and begins the drain
/// sequence; `errors` subscribes to the shared error channel.
pub struct SubscriptionHandle {
    intake_shutdown: CancellationToken,
    dispatcher_shutdown: CancellationToken,
    errors: ErrorChannel,
    drain_deadline: Duration,
    intake_task: tokio::task::JoinHandle<()>,
    dispatcher_task: tokio::task::JoinHandle<()>,
    batcher: Option<Arc<Batcher>>,
}

impl SubscriptionHandle {
    /// Stop accepting new events, flush every Batcher accumulator once, signal the
    /// dispatcher to stop taking new work, then await in-flight dispatches up to
    /// the drain deadline. Events still `Delivering` past the deadline are
    /// abandoned in place — recovery on next start re-dispatches them.
    ///
    /// The flush below lands its batches on the same channel `Dispatcher::run`
    /// reads from; that loop still drains whatever is already queued on it after
    /// `dispatcher_shutdown` cancels (see its doc comment), so the flushed batches
    /// are dispatched rather than abandoned unread.
    pub async fn shutdown(self) {
        self.intake_shutdown.cancel();
        let _ = self.intake_task.await;
        if let Some(batcher) = &self.batcher {
            batcher.flush_all().await;
        }
        self.dispatcher_shutdown.cancel();

        if tokio::time::timeout(self.drain_deadline, self.dispatcher_task).await.is_err() {
            tracing::warn!("drain deadline elapsed with dispatches still in flight; abandoning them");
        }
    }

    pub fn errors(&self) -> tokio::sync::broadcast::Receiver<DispatchErrorEvent> {
        self.errors.subscribe()
    }
}

/// Wires a [`WebhookRepo`], [`WebhookEventRepo`]-sourced event streams, a
/// [`WebhookStateCache`], a [`Batcher`], and a dispatch sink together into the
/// running pipeline described by spec.md §4.1.
///
/// Grounded on `fusillade/src/daemon/mod.rs`'s `Daemon::run`: a periodic-claim loop
/// there becomes a push-driven `tokio_stream::StreamMap`-style merge here, but the
/// overall shape — resolve per-item state, route by a small decision table, spawn
/// bounded work — is the same.
pub async fn start<W, E, S>(
    webhook_repo: Arc<W>,
    event_repo: Arc<E>,
    state: Arc<WebhookStateCache<S>>,
    batcher: Option<Arc<Batcher>>,
    retry: Arc<RetryController<S>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatcher_shutdown: CancellationToken,
    dispatcher_task: tokio::task::JoinHandle<()>,
    errors: ErrorChannel,
    shutdown: ShutdownConfig,
) -> anyhow::Result<SubscriptionHandle>
where
    W: WebhookRepo + 'static,
    E: WebhookEventRepo + 'static,
    S: crate::repo::WebhookStateRepo + 'static,
{
    let intake_shutdown = CancellationToken::new();

    // Startup replay: anything left `Delivering` by a prior crash re-enters the
    // pipeline exactly like a freshly-created event.
    let recovery = event_repo.events_by_status(&[EventStatus::Delivering]).await?;
    let new_events = event_repo.subscribe_to_new_events();

    let recovery = recovery.filter_map(|item| {
        futures::future::ready(match item {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load a recovery event, skipping it");
                None
            }
        })
    });

    let mut merged = futures::stream::select(recovery, new_events);

    let intake_errors = errors.clone();
    let intake_webhook_repo = webhook_repo.clone();
    let intake_state = state.clone();
    let intake_batcher = batcher.clone();
    let intake_retry = retry.clone();
    let intake_dispatch_tx = dispatch_tx.clone();
    let loop_shutdown = intake_shutdown.clone();

    let intake_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = loop_shutdown.cancelled() => break,
                next = merged.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            route_event(event, &intake_webhook_repo, &intake_state, &intake_batcher, &intake_retry, &intake_dispatch_tx, &intake_errors).await;
        }
    });

    Ok(SubscriptionHandle {
        intake_shutdown,
        dispatcher_shutdown,
        errors,
        drain_deadline: shutdown.drain_deadline,
        intake_task,
        dispatcher_task,
        batcher,
    })
}

async fn route_event<W, S>(
    event: WebhookEvent,
    webhook_repo: &Arc<W>,
    state: &Arc<WebhookStateCache<S>>,
    batcher: &Option<Arc<Batcher>>,
    retry: &Arc<RetryController<S>>,
    dispatch_tx: &mpsc::UnboundedSender<Dispatch>,
    errors: &ErrorChannel,
) where
    W: WebhookRepo,
    S: crate::repo::WebhookStateRepo + 'static,
{
    let webhook = match webhook_repo.get(event.webhook_id).await {
        Ok(Some(webhook)) => webhook,
        Ok(None) => {
            errors.publish(DispatchErrorEvent::new(
                Some(event.webhook_id),
                crate::errors::DispatchError::MissingWebhook(event.webhook_id),
            ));
            return;
        }
        Err(err) => {
            errors.publish(DispatchErrorEvent::new(Some(event.webhook_id), crate::errors::DispatchError::repo(err)));
            return;
        }
    };

    let status = match state.get(event.webhook_id).await {
        Ok(status) => status.unwrap_or(webhook.status),
        Err(err) => {
            errors.publish(DispatchErrorEvent::new(Some(event.webhook_id), err));
            return;
        }
    };

    match status {
        WebhookStatus::Enabled => match webhook.delivery_mode.batching {
            Batching::Single => {
                let _ = dispatch_tx.send(Dispatch::single(event.webhook_id, event));
            }
            Batching::Batched => match batcher {
                Some(batcher) => batcher.append(event).await,
                // §6.3: a Batched-mode webhook with no batching configuration present
                // is an invariant violation, not a silent fallback to unbatched
                // delivery — surface it on the error channel and drop the event
                // rather than guessing at a default window.
                None => errors.publish(DispatchErrorEvent::new(
                    Some(event.webhook_id),
                    DispatchError::InvalidStateChange {
                        webhook_id: event.webhook_id,
                        reason: "webhook is configured for batched delivery but no batching configuration is present".to_string(),
                    },
                )),
            },
        },
        // A webhook already retrying has its own in-order queue; new events join
        // its tail rather than starting a parallel in-flight attempt (spec.md
        // §4.4: "New events for a webhook already in Retrying join the tail of
        // the same queue").
        WebhookStatus::Retrying { .. } => {
            retry.enqueue(event.webhook_id, webhook.delivery_mode.batching, vec![event]).await;
        }
        // Disabled or Unavailable: drop silently. Do not mark delivered, do not enqueue.
        WebhookStatus::Disabled | WebhookStatus::Unavailable { .. } => {}
    }
}
