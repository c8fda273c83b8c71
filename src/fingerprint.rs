//! Computing the [`BatchKey`] an event groups under for batched delivery.

use crate::event::WebhookEvent;
use crate::types::BatchKey;

/// Derive the batch grouping key for an event.
///
/// Two events for the same webhook batch together only when their `Content-Type`
/// and `Accept` headers match exactly (case-sensitive, as supplied by the caller) —
/// the engine never normalizes or negotiates on the caller's behalf.
pub fn batch_key_for(event: &WebhookEvent) -> BatchKey {
    BatchKey {
        webhook_id: event.webhook_id,
        content_type: event.headers.content_type().map(str::to_owned),
        accept: event.headers.accept().map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Headers;
    use crate::types::{EventId, EventKey, WebhookId};

    fn event_with(webhook_id: u64, content_type: Option<&str>, accept: Option<&str>) -> WebhookEvent {
        let mut headers = Headers::new();
        if let Some(ct) = content_type {
            headers.push("Content-Type", ct);
        }
        if let Some(a) = accept {
            headers.push("Accept", a);
        }
        WebhookEvent::new(
            EventKey::new(EventId(1), WebhookId(webhook_id)),
            WebhookId(webhook_id),
            "{}",
            headers,
        )
    }

    #[test]
    fn same_webhook_same_headers_share_a_key() {
        let a = event_with(1, Some("application/json"), Some("application/json"));
        let b = event_with(1, Some("application/json"), Some("application/json"));
        assert_eq!(batch_key_for(&a), batch_key_for(&b));
    }

    #[test]
    fn differing_content_type_splits_the_key() {
        let a = event_with(1, Some("application/json"), None);
        let b = event_with(1, Some("application/xml"), None);
        assert_ne!(batch_key_for(&a), batch_key_for(&b));
    }

    #[test]
    fn differing_webhook_splits_the_key_even_with_identical_headers() {
        let a = event_with(1, None, None);
        let b = event_with(2, None, None);
        assert_ne!(batch_key_for(&a), batch_key_for(&b));
    }
}
