//! The `Engine`: the single entry point embedders construct, wiring the state
//! cache, batcher, retry controller, dispatcher, and subscription loop together.
//!
//! Grounded on `fusillade/src/daemon/mod.rs`'s `Daemon<S, H>`: a struct built once
//! from its capabilities (no global singletons, per spec.md §9 "Per-webhook
//! ownership vs. dynamic dispatch").

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batcher::{Batcher, BatchingConfig};
use crate::dispatcher::Dispatcher;
use crate::errors::ErrorChannel;
use crate::repo::{HttpClient, WebhookEventRepo, WebhookRepo, WebhookStateRepo};
use crate::retry::{RetryConfig, RetryController};
use crate::subscription::{self, ShutdownConfig, SubscriptionHandle};
use crate::webhook::WebhookStateCache;

/// Every tunable the engine needs, grouped the way `config.rs` deserializes them.
///
/// `batching: None` models spec.md §6.3's "absence of a batching configuration
/// disables Batched modes": no `Batcher` is constructed at all, and a `Batched`
/// -mode webhook's events are then an invariant violation — surfaced as
/// `InvalidStateChangeError` and dropped (see `subscription.rs::route_event`) —
/// rather than silently falling back to some default window.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub batching: Option<BatchingConfig>,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
    pub error_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batching: Some(BatchingConfig::default()),
            retry: RetryConfig::default(),
            shutdown: ShutdownConfig::default(),
            error_buffer: 128,
        }
    }
}

/// The running dispatch engine. Construct with [`Engine::start`]; call
/// [`Engine::shutdown`] for a graceful drain.
pub struct Engine {
    subscription: SubscriptionHandle,
    reenable_shutdown: CancellationToken,
    reenable_task: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Build every component and start the pipeline. `webhook_repo`/`event_repo`/
    /// `state_repo`/`http` are the four pluggable capabilities described in
    /// spec.md §6.1; everything else is constructed here from `config`.
    pub async fn start<W, E, S, H>(
        webhook_repo: Arc<W>,
        event_repo: Arc<E>,
        state_repo: Arc<S>,
        http: Arc<H>,
        config: EngineConfig,
    ) -> anyhow::Result<Self>
    where
        W: WebhookRepo + 'static,
        E: WebhookEventRepo + 'static,
        S: WebhookStateRepo + 'static,
        H: HttpClient + 'static,
    {
        let errors = ErrorChannel::new(config.error_buffer);
        let state = Arc::new(WebhookStateCache::new(state_repo));

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let retry = Arc::new(RetryController::new(config.retry, state.clone(), dispatch_tx.clone(), errors.clone()));

        // Watches the state repo's out-of-band update stream (§6.1) so an operator
        // re-enabling a webhook through an admin UI is reflected here: the cache
        // entry is invalidated and, per §4.4, any surviving retry queue is
        // discarded rather than left to keep retrying a webhook that is Enabled
        // again.
        let reenable_shutdown = CancellationToken::new();
        let reenable_task = {
            let state = state.clone();
            let retry = retry.clone();
            let shutdown = reenable_shutdown.clone();
            tokio::spawn(async move {
                let mut updates = state.subscribe_to_updates();
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        next = updates.next() => match next {
                            Some((webhook_id, status)) => {
                                state.invalidate(webhook_id);
                                if matches!(status, crate::webhook::WebhookStatus::Enabled) {
                                    retry.discard_queue(webhook_id);
                                }
                            }
                            None => break,
                        },
                    }
                }
            })
        };

        let dispatcher = Arc::new(Dispatcher::new(webhook_repo.clone(), event_repo.clone(), http, retry.clone(), errors.clone()));
        let dispatcher_shutdown = CancellationToken::new();
        let dispatcher_task = {
            let dispatcher = dispatcher.clone();
            let dispatcher_shutdown = dispatcher_shutdown.clone();
            tokio::spawn(async move { dispatcher.run(dispatch_rx, dispatcher_shutdown).await })
        };

        let batcher = config.batching.map(|cfg| Arc::new(Batcher::new(cfg, dispatch_tx.clone())));

        let subscription = subscription::start(
            webhook_repo,
            event_repo,
            state,
            batcher,
            retry,
            dispatch_tx,
            dispatcher_shutdown,
            dispatcher_task,
            errors,
            config.shutdown,
        )
        .await?;

        Ok(Self { subscription, reenable_shutdown, reenable_task })
    }

    /// Subscribe to the structural error channel (§4.6). Each subscriber sees
    /// every error published from the point it subscribed onward.
    pub fn errors(&self) -> tokio::sync::broadcast::Receiver<crate::errors::DispatchErrorEvent> {
        self.subscription.errors()
    }

    /// Stop accepting new events and drain in-flight work (§5 "Cancellation").
    pub async fn shutdown(self) {
        self.reenable_shutdown.cancel();
        let _ = self.reenable_task.await;
        self.subscription.shutdown().await;
    }
}
