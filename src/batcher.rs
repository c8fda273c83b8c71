//! Per-key time- and size-windowed accumulation of events into batched dispatches.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::event::WebhookEvent;
use crate::fingerprint::batch_key_for;
use crate::types::{BatchKey, Dispatch};

/// `max-size`/`max-wait` knobs for every accumulator the batcher owns.
#[derive(Debug, Clone, Copy)]
pub struct BatchingConfig {
    pub max_size: usize,
    pub max_wait: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { max_size: 10, max_wait: Duration::from_secs(5) }
    }
}

/// One accumulator per [`BatchKey`], lazily created on first arrival and torn down
/// once it emits. Feeder access is single-writer (the task owning the key), so the
/// pending list itself only needs a `Mutex` for the rare case of a concurrent flush
/// racing the timer — contention is not expected in practice.
struct Accumulator {
    pending: Mutex<Vec<WebhookEvent>>,
    notify: tokio::sync::Notify,
}

/// Registry of per-key accumulators plus the tasks that watch their timers.
///
/// Grounded on `fusillade`'s `Daemon::get_semaphore` registry (`DashMap<String, Arc<Semaphore>>`,
/// lazily inserted on first use) generalized from per-model semaphores to per-`BatchKey`
/// accumulators; the size-vs-timer race is a `tokio::select!`, the same shape `dwctl`'s
/// `run_sender` uses to race a channel receive against a shutdown signal.
pub struct Batcher {
    config: BatchingConfig,
    accumulators: Arc<DashMap<BatchKey, Arc<Accumulator>>>,
    out_tx: mpsc::UnboundedSender<Dispatch>,
}

impl Batcher {
    /// `out_tx` is the channel batches are emitted onto, consumed by the Dispatcher.
    pub fn new(config: BatchingConfig, out_tx: mpsc::UnboundedSender<Dispatch>) -> Self {
        Self { config, accumulators: Arc::new(DashMap::new()), out_tx }
    }

    /// Append an event under its batch key, starting a fresh accumulator (and its
    /// watcher task) if none exists yet for that key.
    pub async fn append(&self, event: WebhookEvent) {
        let key = batch_key_for(&event);
        let webhook_id = event.webhook_id;

        let is_first = !self.accumulators.contains_key(&key);
        let accumulator = self
            .accumulators
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Accumulator { pending: Mutex::new(Vec::new()), notify: tokio::sync::Notify::new() }))
            .clone();

        {
            let mut pending = accumulator.pending.lock().await;
            pending.push(event);
            let at_capacity = pending.len() >= self.config.max_size;
            drop(pending);

            if at_capacity {
                self.flush_key(&key, &accumulator).await;
                return;
            }
        }

        if is_first {
            self.spawn_watcher(key, webhook_id, accumulator);
        } else {
            accumulator.notify.notify_one();
        }
    }

    /// Watches a single accumulator's `max-wait` timer, flushing when it elapses
    /// unless a concurrent size-triggered flush (or shutdown flush) already drained it.
    fn spawn_watcher(&self, key: BatchKey, webhook_id: crate::types::WebhookId, accumulator: Arc<Accumulator>) {
        let accumulators = self.accumulators.clone();
        let out_tx = self.out_tx.clone();
        let max_wait = self.config.max_wait;

        tokio::spawn(async move {
            let deadline = Instant::now() + max_wait;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = accumulator.notify.notified() => {
                        // Woken by a size-triggered flush or a key removal; re-check.
                        if !accumulators.contains_key(&key) {
                            return;
                        }
                    }
                }
            }

            let mut pending = accumulator.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            let events = std::mem::take(&mut *pending);
            drop(pending);
            accumulators.remove(&key);
            counter!("dispatch_batches_emitted_total").increment(1);
            let _ = out_tx.send(Dispatch::batch(webhook_id, events));
        });
    }

    async fn flush_key(&self, key: &BatchKey, accumulator: &Arc<Accumulator>) {
        let mut pending = accumulator.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut *pending);
        let webhook_id = events[0].webhook_id;
        drop(pending);
        self.accumulators.remove(key);
        accumulator.notify.notify_one();
        counter!("dispatch_batches_emitted_total").increment(1);
        let _ = self.out_tx.send(Dispatch::batch(webhook_id, events));
    }

    /// Flush every live accumulator immediately, draining whatever has arrived so
    /// far regardless of size or timer state. Used once, at shutdown (spec.md §5).
    pub async fn flush_all(&self) {
        let keys: Vec<BatchKey> = self.accumulators.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, accumulator)) = self.accumulators.remove(&key) {
                let mut pending = accumulator.pending.lock().await;
                if pending.is_empty() {
                    continue;
                }
                let events = std::mem::take(&mut *pending);
                let webhook_id = events[0].webhook_id;
                drop(pending);
                accumulator.notify.notify_one();
                counter!("dispatch_batches_emitted_total").increment(1);
                let _ = self.out_tx.send(Dispatch::batch(webhook_id, events));
            }
        }
    }
}
