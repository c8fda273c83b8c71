//! Webhook registration state and the write-through status cache.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, Result};
use crate::repo::WebhookStateRepo;
use crate::types::{DeliveryMode, WebhookId};

/// A registered webhook. Created externally; only `status` is mutated by the core.
#[derive(Debug, Clone)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: String,
    pub label: String,
    pub status: WebhookStatus,
    pub delivery_mode: DeliveryMode,
}

impl Webhook {
    pub fn is_enabled(&self) -> bool {
        matches!(self.status, WebhookStatus::Enabled)
    }
}

/// Exactly one active variant at a time; see spec.md §4.4 for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WebhookStatus {
    Enabled,
    Disabled,
    Retrying { since: DateTime<Utc> },
    Unavailable { since: DateTime<Utc> },
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Retrying { .. } => "retrying",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Write-through cache over the [`WebhookStateRepo`]: reads prefer the cache, falling
/// back to the repo on miss; writes land in the repo first and only update the cache
/// once that write succeeds.
///
/// Grounded on the teacher's `InMemoryStorage`/`Webhooks` repo split (`batcher/src/storage/in_memory.rs`,
/// `dwctl/src/db/handlers/webhooks.rs`): an in-memory projection in front of a durable store.
pub struct WebhookStateCache<R: WebhookStateRepo> {
    repo: Arc<R>,
    cache: DashMap<WebhookId, WebhookStatus>,
}

impl<R: WebhookStateRepo> WebhookStateCache<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo, cache: DashMap::new() }
    }

    /// Current status for a webhook, preferring the cache.
    pub async fn get(&self, id: WebhookId) -> Result<Option<WebhookStatus>> {
        if let Some(status) = self.cache.get(&id) {
            return Ok(Some(*status));
        }

        let status = self.repo.get_status(id).await.map_err(DispatchError::repo)?;
        if let Some(status) = status {
            self.cache.insert(id, status);
        }
        Ok(status)
    }

    /// Persist a status transition: repo write first, cache updated only on success.
    pub async fn set_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        self.repo.set_status(id, status).await.map_err(DispatchError::repo)?;
        self.cache.insert(id, status);
        tracing::info!(webhook_id = %id, status = %status, "webhook status transitioned");
        Ok(())
    }

    /// Invalidate a cached entry, forcing the next `get` to consult the repo.
    /// Used when an external `subscribeToWebhookUpdates()` signal (an operator
    /// re-enable) arrives out of band from this cache's own writes.
    pub fn invalidate(&self, id: WebhookId) {
        self.cache.remove(&id);
    }

    /// Proxy for the underlying repo's update stream (§6.1), carrying both this
    /// cache's own writes and any out-of-band operator changes.
    pub fn subscribe_to_updates(&self) -> Pin<Box<dyn Stream<Item = (WebhookId, WebhookStatus)> + Send>> {
        self.repo.subscribe_to_updates()
    }
}
