//! Per-webhook retry queues: exponential backoff, the 7-day failure horizon, and
//! the `Enabled -> Retrying -> Unavailable` transition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::errors::{DispatchErrorEvent, ErrorChannel};
use crate::event::WebhookEvent;
use crate::types::{Batching, Dispatch, WebhookId};
use crate::webhook::{WebhookStateCache, WebhookStatus};

/// `base`/`max` backoff knobs and the failure horizon after which a retrying
/// webhook is abandoned.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub failure_horizon: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(3600),
            failure_horizon: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^attempts, max)`.
    pub fn next_wait(&self, attempts: u32) -> Duration {
        self.base.checked_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX).max(1)).unwrap_or(self.max).min(self.max)
    }
}

/// One webhook's queue of failed events awaiting retry, plus its backoff state.
struct RetryQueue {
    events: VecDeque<WebhookEvent>,
    attempts: u32,
    first_failure_at: chrono::DateTime<Utc>,
    /// Captured from the webhook's `DeliveryMode` at queue creation (immutable for
    /// the webhook's lifetime): decides whether the ticker drains one event per
    /// tick or the whole queue (spec.md §4.4 step 2).
    batching: Batching,
    /// Set by [`RetryController::report_outcome`] when an attempt succeeds and
    /// leaves the queue non-empty: per spec.md §4.4 step 3, "if queue non-empty,
    /// continue without backoff". The ticker consumes this (resetting it) instead
    /// of sleeping `next_wait(0)` before its next dispatch.
    skip_backoff: bool,
}

/// A webhook's queue plus the `Notify` its ticker blocks on between submitting a
/// dispatch and hearing back from [`RetryController::report_outcome`]. Kept as an
/// `Arc` (rather than borrowed from the `DashMap` entry) so the ticker can drop its
/// shard lock before awaiting — holding a `DashMap` `Ref` across a long await would
/// block any other task touching the same shard's key.
struct QueueEntry {
    queue: Mutex<RetryQueue>,
    completed: Arc<Notify>,
}

/// Owns every webhook's retry queue and the background ticker that drains them.
///
/// Grounded directly on `fusillade/src/request/transitions.rs`'s `Request<Failed>::retry`
/// for the backoff formula, and on spec.md §9's resolution of the Retry Controller ↔
/// Dispatcher cycle: the controller submits `Dispatch` units to a shared `mpsc` channel
/// and reacts only to outcomes tagged with its own webhook id, delivered over a
/// `tokio::sync::broadcast` subscription — breaking the cycle via message passing rather
/// than a direct call edge between the two components.
pub struct RetryController<R: crate::repo::WebhookStateRepo> {
    config: RetryConfig,
    queues: Arc<DashMap<WebhookId, QueueEntry>>,
    state: Arc<WebhookStateCache<R>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    errors: ErrorChannel,
}

/// Outcome of one dispatch attempt, as reported back to the controller that owns
/// the webhook in question.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub webhook_id: WebhookId,
    pub succeeded: bool,
}

impl<R: crate::repo::WebhookStateRepo + 'static> RetryController<R> {
    pub fn new(
        config: RetryConfig,
        state: Arc<WebhookStateCache<R>>,
        dispatch_tx: mpsc::UnboundedSender<Dispatch>,
        errors: ErrorChannel,
    ) -> Self {
        Self { config, queues: Arc::new(DashMap::new()), state, dispatch_tx, errors }
    }

    /// Hand a failed event (or batch) to its webhook's retry queue, creating the
    /// queue — and transitioning the webhook to `Retrying` — if this is its first
    /// failure. Events for a webhook already `Retrying` simply join the tail.
    ///
    /// `is_new` is decided by the `DashMap` entry match itself rather than a
    /// preceding `contains_key` check, so two concurrent first failures for the
    /// same webhook can't both observe "no queue yet" and each spawn their own
    /// ticker.
    pub async fn enqueue(&self, webhook_id: WebhookId, batching: Batching, events: Vec<WebhookEvent>) {
        use dashmap::mapref::entry::Entry;

        let now = Utc::now();

        let is_new = match self.queues.entry(webhook_id) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_ref();
                let mut queue = entry.queue.lock().await;
                queue.events.extend(events);
                false
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(QueueEntry {
                    queue: Mutex::new(RetryQueue {
                        events: VecDeque::new(),
                        attempts: 0,
                        first_failure_at: now,
                        batching,
                        skip_backoff: false,
                    }),
                    completed: Arc::new(Notify::new()),
                });
                let mut queue = entry.queue.lock().await;
                queue.events.extend(events);
                true
            }
        };

        if is_new {
            if let Err(err) = self.state.set_status(webhook_id, WebhookStatus::Retrying { since: now }).await {
                self.errors.publish(DispatchErrorEvent::new(Some(webhook_id), err));
            }
            self.spawn_ticker(webhook_id);
        }
    }

    /// Discard a webhook's retry queue without retrying it further, ending its
    /// ticker task. Used when an operator re-enables a webhook out of band (§4.4:
    /// "Unavailable --operator re-enable--> Enabled (retry queue discarded)").
    pub fn discard_queue(&self, webhook_id: WebhookId) {
        if let Some((_, entry)) = self.queues.remove(&webhook_id) {
            entry.completed.notify_one();
        }
    }

    /// Report the result of a dispatch attempt the controller submitted. Resets
    /// backoff and, on an empty queue, quiesces the webhook back to `Enabled`; on
    /// failure, re-queues at the head, increments attempts, and checks the horizon.
    /// Always wakes the webhook's ticker so it can submit its next attempt — this is
    /// what keeps at most one dispatch in flight per retrying webhook (spec.md §5).
    pub async fn report_outcome(&self, outcome: DispatchOutcome, retried_events: Vec<WebhookEvent>) {
        let Some(entry) = self.queues.get(&outcome.webhook_id) else { return };
        let completed = entry.completed.clone();
        let mut queue = entry.queue.lock().await;

        if outcome.succeeded {
            queue.attempts = 0;
            if queue.events.is_empty() {
                drop(queue);
                drop(entry);
                self.queues.remove(&outcome.webhook_id);
                completed.notify_one();
                if let Err(err) = self.state.set_status(outcome.webhook_id, WebhookStatus::Enabled).await {
                    self.errors.publish(DispatchErrorEvent::new(Some(outcome.webhook_id), err));
                }
            } else {
                queue.skip_backoff = true;
                drop(queue);
                drop(entry);
                completed.notify_one();
            }
            return;
        }

        counter!("dispatch_retries_total").increment(1);

        for event in retried_events.into_iter().rev() {
            queue.events.push_front(event);
        }
        queue.attempts += 1;

        let elapsed = Utc::now().signed_duration_since(queue.first_failure_at).to_std().unwrap_or(Duration::ZERO);
        let horizon_crossed = elapsed >= self.config.failure_horizon;

        if horizon_crossed && !queue.events.is_empty() {
            drop(queue);
            drop(entry);
            self.queues.remove(&outcome.webhook_id);
            completed.notify_one();
            let since = Utc::now();
            if let Err(err) = self.state.set_status(outcome.webhook_id, WebhookStatus::Unavailable { since }).await {
                self.errors.publish(DispatchErrorEvent::new(Some(outcome.webhook_id), err));
            }
            counter!("dispatch_webhooks_unavailable_total").increment(1);
            self.errors.publish(DispatchErrorEvent::new(
                Some(outcome.webhook_id),
                crate::errors::DispatchError::WebhookUnavailable(outcome.webhook_id),
            ));
        } else {
            drop(queue);
            drop(entry);
            completed.notify_one();
        }
    }

    /// The background task for one webhook: waits `next-wait` (or, immediately
    /// following a success that left the queue non-empty, no wait at all — spec.md
    /// §4.4 step 3), drains the queue — the whole queue for `Batched` modes, one
    /// event for `Single` modes (spec.md §4.4 step 2) — submits it, then blocks
    /// until [`report_outcome`] wakes it before looping. That block is what
    /// guarantees at most one in-flight dispatch per retrying webhook at any
    /// instant. Exits once the queue is removed (on quiescing back to `Enabled`,
    /// transitioning to `Unavailable`, or an operator re-enable).
    fn spawn_ticker(&self, webhook_id: WebhookId) {
        let queues = self.queues.clone();
        let dispatch_tx = self.dispatch_tx.clone();
        let config = self.config;

        tokio::spawn(async move {
            loop {
                let Some(entry) = queues.get(&webhook_id) else { return };
                let wait = {
                    let mut queue = entry.queue.lock().await;
                    // A prior attempt just succeeded and left events pending: spec.md
                    // §4.4 step 3 says to continue without backoff, so this tick's
                    // wait collapses to zero instead of `next_wait(0)`.
                    let skip_backoff = std::mem::take(&mut queue.skip_backoff);
                    if skip_backoff { Duration::ZERO } else { config.next_wait(queue.attempts) }
                };
                drop(entry);

                tokio::time::sleep(wait).await;

                let Some(entry) = queues.get(&webhook_id) else { return };
                let (events, batched, completed) = {
                    let mut queue = entry.queue.lock().await;
                    let batched = matches!(queue.batching, Batching::Batched);
                    let events: Vec<WebhookEvent> = match queue.batching {
                        Batching::Single => queue.events.pop_front().into_iter().collect(),
                        Batching::Batched => queue.events.drain(..).collect(),
                    };
                    (events, batched, entry.completed.clone())
                };
                drop(entry);

                if events.is_empty() {
                    continue;
                }

                // Register interest in the completion notification before submitting,
                // so a very fast outcome can never be missed between send and await.
                let notified = completed.notified();
                let _ = dispatch_tx.send(Dispatch::retry(webhook_id, events, batched));
                notified.await;

                if !queues.contains_key(&webhook_id) {
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let config = RetryConfig { base: Duration::from_secs(10), max: Duration::from_secs(3600), failure_horizon: Duration::from_secs(1) };
        assert_eq!(config.next_wait(0), Duration::from_secs(10));
        assert_eq!(config.next_wait(1), Duration::from_secs(20));
        assert_eq!(config.next_wait(2), Duration::from_secs(40));
        assert_eq!(config.next_wait(20), Duration::from_secs(3600));
    }
}
