//! Event types: the unit of data addressed to a webhook.

use serde::{Deserialize, Serialize};

use crate::types::{EventKey, Header, WebhookId};

/// An ordered, possibly-repeating multimap of HTTP headers.
///
/// Preserved verbatim for single dispatch; used to compute the [`crate::types::BatchKey`]
/// and to derive the shared headers of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(pub Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for a header name, case-insensitive, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn accept(&self) -> Option<&str> {
        self.get("Accept")
    }
}

/// Status of an event's delivery, monotonic within `New -> Delivering -> {Delivered, Failed}`
/// except for the `Failed -> Delivering` transition made when a retry attempt begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Delivering,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal transition per spec.md §3's event lifecycle.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (New, Delivering) | (Delivering, Delivered) | (Delivering, Failed) | (Failed, Delivering)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event destined for a webhook. Content is opaque and immutable; the engine
/// never parses or transforms it, only forwards it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: EventKey,
    pub webhook_id: WebhookId,
    pub status: EventStatus,
    pub content: String,
    pub headers: Headers,
}

impl WebhookEvent {
    pub fn new(key: EventKey, webhook_id: WebhookId, content: impl Into<String>, headers: Headers) -> Self {
        Self {
            key,
            webhook_id,
            status: EventStatus::New,
            content: content.into(),
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_get_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.content_type(), Some("application/json"));
    }

    #[test]
    fn status_transitions_follow_the_lifecycle() {
        assert!(EventStatus::New.can_transition_to(EventStatus::Delivering));
        assert!(EventStatus::Delivering.can_transition_to(EventStatus::Delivered));
        assert!(EventStatus::Delivering.can_transition_to(EventStatus::Failed));
        assert!(EventStatus::Failed.can_transition_to(EventStatus::Delivering));
        assert!(!EventStatus::New.can_transition_to(EventStatus::Delivered));
        assert!(!EventStatus::Delivered.can_transition_to(EventStatus::Delivering));
    }
}
