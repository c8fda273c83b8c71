//! The crate's single error type and the broadcast-based error channel.

use tokio::sync::broadcast;

use crate::types::WebhookId;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Everything the dispatch engine can fail with. Repo and HTTP failures carry an
/// opaque `anyhow::Error` cause, matching the split the teacher draws in
/// `dwctl/src/errors.rs` between typed, engine-meaningful variants and a wrapped
/// catch-all for capability-trait failures the core cannot interpret further.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("event referenced unknown webhook {0}")]
    MissingWebhook(WebhookId),

    #[error("webhook {0} is unavailable and not accepting deliveries")]
    WebhookUnavailable(WebhookId),

    #[error("invalid state change for webhook {webhook_id}: {reason}")]
    InvalidStateChange { webhook_id: WebhookId, reason: String },

    #[error("repository error: {0}")]
    Repo(#[source] anyhow::Error),

    #[error("http client error: {0}")]
    Http(#[source] anyhow::Error),

    #[error("dispatch engine is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    pub fn repo(cause: impl Into<anyhow::Error>) -> Self {
        Self::Repo(cause.into())
    }

    pub fn http(cause: impl Into<anyhow::Error>) -> Self {
        Self::Http(cause.into())
    }
}

/// Identifies which webhook/event an error is associated with, if any, so
/// subscribers to the error channel can correlate failures with their source.
#[derive(Debug, Clone)]
pub struct DispatchErrorEvent {
    pub webhook_id: Option<WebhookId>,
    pub error: std::sync::Arc<DispatchError>,
}

impl DispatchErrorEvent {
    pub fn new(webhook_id: Option<WebhookId>, error: DispatchError) -> Self {
        Self { webhook_id, error: std::sync::Arc::new(error) }
    }
}

/// The error channel described in spec.md §6.3: a fan-out stream of failures that
/// does not block the pipeline producing them.
///
/// `tokio::sync::broadcast` is used rather than an mpsc channel because it gives us,
/// for free, the two properties the spec actually asks for: multiple independent
/// consumers each see every error from the point they subscribed, and a slow or
/// absent consumer cannot back up the producer — `broadcast` drops the oldest
/// buffered messages and reports the gap via `RecvError::Lagged` instead of blocking
/// the sender. See SPEC_FULL.md §4.6 for the full rationale.
#[derive(Clone)]
pub struct ErrorChannel {
    tx: broadcast::Sender<DispatchErrorEvent>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an error. Never blocks; if there are no subscribers the error is
    /// simply dropped.
    pub fn publish(&self, event: DispatchErrorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchErrorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_see_published_errors() {
        let channel = ErrorChannel::new(8);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(DispatchErrorEvent::new(
            Some(WebhookId(1)),
            DispatchError::MissingWebhook(WebhookId(1)),
        ));

        let event_a = a.recv().await.unwrap();
        let event_b = b.recv().await.unwrap();
        assert_eq!(event_a.webhook_id, Some(WebhookId(1)));
        assert_eq!(event_b.webhook_id, Some(WebhookId(1)));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let channel = ErrorChannel::new(8);
        channel.publish(DispatchErrorEvent::new(None, DispatchError::ShuttingDown));
    }
}
