//! End-to-end scenarios against the in-memory doubles, covering the dispatch
//! engine's documented testable properties: single happy-path delivery, fan-out,
//! disabled-webhook drops, size- and time-triggered batching, and the missing-
//! webhook error surface.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use webhook_dispatch::batcher::BatchingConfig;
use webhook_dispatch::engine::EngineConfig;
use webhook_dispatch::event::{EventStatus, Headers};
use webhook_dispatch::testing::{InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo, MockHttpClient};
use webhook_dispatch::types::{EventId, EventKey, HttpResponse};
use webhook_dispatch::{DeliveryMode, Engine, Webhook, WebhookId, WebhookStatus};

fn engine_config(batching: BatchingConfig) -> EngineConfig {
    EngineConfig { batching: Some(batching), ..EngineConfig::default() }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn enabled_webhook(id: u64, url: &str, mode: DeliveryMode) -> Webhook {
    Webhook { id: WebhookId(id), url: url.to_string(), label: format!("webhook-{id}"), status: WebhookStatus::Enabled, delivery_mode: mode }
}

#[tokio::test]
async fn scenario_1_single_dispatch_happy_path() {
    let webhook_repo = Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::SINGLE_AT_MOST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), EngineConfig::default()).await.unwrap();

    let key = EventKey::new(EventId(0), WebhookId(0));
    let mut headers = Headers::new();
    headers.push("Accept", "*/*");
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), "event payload", headers)).await.unwrap();

    wait_until(|| http.call_count() == 1, Duration::from_secs(2)).await;

    let calls = http.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://example.org/0");
    assert_eq!(calls[0].body, "event payload");
    assert!(calls[0].headers.iter().any(|(k, v)| k == "Accept" && v == "*/*"));

    wait_until(|| event_repo.get(key).map(|e| e.status) == Some(EventStatus::Delivered), Duration::from_secs(2)).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn scenario_2_fan_out_across_a_hundred_webhooks() {
    let webhooks: Vec<Webhook> = (0..100)
        .map(|i| enabled_webhook(i, &format!("http://example.org/{i}"), DeliveryMode::SINGLE_AT_MOST_ONCE))
        .collect();
    let webhook_repo = Arc::new(InMemoryWebhookRepo::new(webhooks));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    for i in 0..100 {
        state_repo.operator_set_status(WebhookId(i), WebhookStatus::Enabled);
    }
    let http = Arc::new(MockHttpClient::new());
    for i in 0..100 {
        http.queue_response(format!("http://example.org/{i}"), HttpResponse { status: 200 });
    }

    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), EngineConfig::default()).await.unwrap();

    for i in 0..100u64 {
        let key = EventKey::new(EventId(i), WebhookId(i));
        event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(i), "payload", Headers::new())).await.unwrap();
    }

    wait_until(|| http.call_count() == 100, Duration::from_secs(5)).await;
    assert_eq!(http.call_count(), 100);

    engine.shutdown().await;
}

#[tokio::test]
async fn scenario_3_disabled_webhook_drops_events() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([Webhook {
            id: WebhookId(0),
            url: "http://example.org/0".to_string(),
            label: "disabled".to_string(),
            status: WebhookStatus::Disabled,
            delivery_mode: DeliveryMode::SINGLE_AT_MOST_ONCE,
        }]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Disabled);
    let http = Arc::new(MockHttpClient::new());

    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), EngineConfig::default()).await.unwrap();

    let mut keys = Vec::new();
    for i in 0..100u64 {
        let key = EventKey::new(EventId(i), WebhookId(0));
        keys.push(key);
        event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), "payload", Headers::new())).await.unwrap();
    }

    // Give the pipeline a generous window to (incorrectly) dispatch, then assert it didn't.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(http.call_count(), 0);
    for key in keys {
        assert_eq!(event_repo.get(key).unwrap().status, EventStatus::New);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn scenario_4_batching_by_size() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::BATCHED_AT_MOST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    for _ in 0..10 {
        http.queue_response("http://example.org/0", HttpResponse { status: 200 });
    }

    let config = engine_config(BatchingConfig { max_size: 10, max_wait: Duration::from_secs(5) });
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), config).await.unwrap();

    for i in 0..100u64 {
        let key = EventKey::new(EventId(i), WebhookId(0));
        event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), format!("payload-{i}"), Headers::new())).await.unwrap();
    }

    wait_until(|| http.call_count() == 10, Duration::from_secs(5)).await;

    for call in http.calls() {
        let elements: Vec<String> = serde_json::from_str(&call.body).expect("batch body is a JSON array");
        assert_eq!(elements.len(), 10);
    }

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_5_batching_by_time() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::BATCHED_AT_MOST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    let config = engine_config(BatchingConfig { max_size: 100, max_wait: Duration::from_secs(5) });
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), config).await.unwrap();

    for i in 0..5u64 {
        let key = EventKey::new(EventId(i), WebhookId(0));
        event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), format!("payload-{i}"), Headers::new())).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(http.call_count(), 0, "must not emit before max-wait elapses");

    tokio::time::advance(Duration::from_secs(6)).await;
    wait_until(|| http.call_count() == 1, Duration::from_secs(2)).await;

    let calls = http.calls();
    let elements: Vec<String> = serde_json::from_str(&calls[0].body).unwrap();
    assert_eq!(elements.len(), 5);

    engine.shutdown().await;
}

#[tokio::test]
async fn scenario_6_missing_webhook_surfaces_an_error() {
    let webhook_repo = Arc::new(InMemoryWebhookRepo::new(Vec::<Webhook>::new()));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    let http = Arc::new(MockHttpClient::new());

    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), EngineConfig::default()).await.unwrap();
    let mut errors = engine.errors();

    let key = EventKey::new(EventId(0), WebhookId(404));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(404), "payload", Headers::new())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), errors.recv()).await.expect("timed out waiting for an error");
    match event {
        Ok(event) => {
            assert_eq!(event.webhook_id, Some(WebhookId(404)));
            assert!(matches!(&*event.error, webhook_dispatch::DispatchError::MissingWebhook(id) if *id == WebhookId(404)));
        }
        Err(RecvError::Lagged(_)) => panic!("unexpectedly lagged before receiving the expected error"),
        Err(err) => panic!("error channel closed unexpectedly: {err}"),
    }

    assert_eq!(http.call_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn batched_webhook_with_no_batching_config_surfaces_invalid_state_change_and_drops_the_event() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::BATCHED_AT_MOST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());

    let config = EngineConfig { batching: None, ..EngineConfig::default() };
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), config).await.unwrap();
    let mut errors = engine.errors();

    let key = EventKey::new(EventId(0), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), "payload", Headers::new())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), errors.recv()).await.expect("timed out waiting for an error");
    match event {
        Ok(event) => {
            assert_eq!(event.webhook_id, Some(WebhookId(0)));
            assert!(matches!(
                &*event.error,
                webhook_dispatch::DispatchError::InvalidStateChange { webhook_id, .. } if *webhook_id == WebhookId(0)
            ));
        }
        Err(RecvError::Lagged(_)) => panic!("unexpectedly lagged before receiving the expected error"),
        Err(err) => panic!("error channel closed unexpectedly: {err}"),
    }

    assert_eq!(http.call_count(), 0, "a rejected batched event must never be dispatched");
    let stored = event_repo.get(key).expect("event was stored");
    assert_eq!(stored.status, EventStatus::New, "a rejected event must not be marked Delivering or Delivered");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_at_least_once_delivery_is_retried_until_it_succeeds() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::SINGLE_AT_LEAST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 500 });
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    let config = engine_config(BatchingConfig::default());
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo.clone(), http.clone(), config).await.unwrap();

    let key = EventKey::new(EventId(0), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), "payload", Headers::new())).await.unwrap();

    wait_until(|| http.call_count() == 1, Duration::from_secs(2)).await;
    assert_eq!(event_repo.get(key).unwrap().status, EventStatus::Failed);
    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Retrying { .. })),
        Duration::from_secs(2),
    )
    .await;

    // Default retry.base is 10s; advance past it so the controller's ticker fires.
    tokio::time::advance(Duration::from_secs(11)).await;

    wait_until(|| http.call_count() == 2, Duration::from_secs(2)).await;
    wait_until(|| event_repo.get(key).map(|e| e.status) == Some(EventStatus::Delivered), Duration::from_secs(2)).await;
    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Enabled)),
        Duration::from_secs(2),
    )
    .await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn operator_re_enable_discards_the_retry_queue_and_stops_retrying() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::SINGLE_AT_LEAST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 500 });

    let mut config = engine_config(BatchingConfig::default());
    config.retry.base = Duration::from_millis(100);
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo.clone(), http.clone(), config).await.unwrap();

    let key = EventKey::new(EventId(0), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), "payload", Headers::new())).await.unwrap();

    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Retrying { .. })),
        Duration::from_secs(2),
    )
    .await;

    // Operator re-enables the webhook directly, out of band from the controller's
    // own eventual quiescing. The surviving retry queue must be discarded, not
    // retried further once the ticker's backoff elapses.
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let calls_at_reenable = http.call_count();

    // Advance well past several would-be retry ticks; no further calls should land.
    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(http.call_count(), calls_at_reenable, "discarded queue must not keep retrying");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn new_events_for_a_retrying_single_mode_webhook_join_its_queue_one_at_a_time() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::SINGLE_AT_LEAST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 500 });
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    let mut config = engine_config(BatchingConfig::default());
    config.retry.base = Duration::from_millis(200);
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo.clone(), http.clone(), config).await.unwrap();

    let key1 = EventKey::new(EventId(1), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key1, WebhookId(0), "first", Headers::new())).await.unwrap();

    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Retrying { .. })),
        Duration::from_secs(2),
    )
    .await;

    // Arrives while the webhook is already Retrying: it must join the queue's
    // tail rather than being dropped (spec.md §4.4).
    let key2 = EventKey::new(EventId(2), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key2, WebhookId(0), "second", Headers::new())).await.unwrap();

    // One backoff wait gets the queue draining; per spec.md §4.4 step 3 the first
    // retry's success (key1) leaves the queue non-empty (key2) and must continue
    // without a further backoff wait, so both retries land without advancing time
    // again in between.
    tokio::time::advance(Duration::from_millis(210)).await;
    wait_until(|| http.call_count() == 3, Duration::from_secs(2)).await;
    wait_until(|| event_repo.get(key1).map(|e| e.status) == Some(EventStatus::Delivered), Duration::from_secs(2)).await;
    wait_until(|| event_repo.get(key2).map(|e| e.status) == Some(EventStatus::Delivered), Duration::from_secs(2)).await;
    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Enabled)),
        Duration::from_secs(2),
    )
    .await;

    // A Single-mode webhook retries one event per tick, never merging queued
    // events into one request: the two retries must be distinct requests, each
    // carrying exactly one event's body, in arrival order.
    let calls = http.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].body, "first");
    assert_eq!(calls[2].body, "second");

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_a_pending_batch_instead_of_abandoning_it() {
    // Events below max-size with a max-wait long enough that the timer never
    // fires on its own: the only way these are ever dispatched is the shutdown
    // flush (spec.md §5(b): "all Batcher accumulators flush once").
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::BATCHED_AT_MOST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    let config = engine_config(BatchingConfig { max_size: 10, max_wait: Duration::from_secs(3600) });
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo, http.clone(), config).await.unwrap();

    let mut keys = Vec::new();
    for i in 0..3u64 {
        let key = EventKey::new(EventId(i), WebhookId(0));
        keys.push(key);
        event_repo.create_event(webhook_dispatch::WebhookEvent::new(key, WebhookId(0), format!("payload-{i}"), Headers::new())).await.unwrap();
    }

    // Give the accumulator a moment to actually receive all three appends before
    // shutdown races the flush against them.
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;

    assert_eq!(http.call_count(), 1, "the partial batch must be flushed and dispatched, not abandoned");
    let elements: Vec<String> = serde_json::from_str(&http.calls()[0].body).expect("flushed batch body is a JSON array");
    assert_eq!(elements.len(), 3);
    for key in keys {
        assert_eq!(event_repo.get(key).map(|e| e.status), Some(EventStatus::Delivered), "flushed events must reach a terminal status, not stay New");
    }
}

#[tokio::test(start_paused = true)]
async fn a_batched_webhooks_retry_drains_its_whole_queue_in_one_dispatch() {
    let webhook_repo =
        Arc::new(InMemoryWebhookRepo::new([enabled_webhook(0, "http://example.org/0", DeliveryMode::BATCHED_AT_LEAST_ONCE)]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(0), WebhookStatus::Enabled);
    let http = Arc::new(MockHttpClient::new());
    http.queue_response("http://example.org/0", HttpResponse { status: 500 });
    http.queue_response("http://example.org/0", HttpResponse { status: 200 });

    // Large max-size/max-wait so both events land in the same first batch rather
    // than being split by the Batcher itself.
    let mut config = engine_config(BatchingConfig { max_size: 100, max_wait: Duration::from_secs(60) });
    config.retry.base = Duration::from_millis(200);
    let engine = Engine::start(webhook_repo, event_repo.clone(), state_repo.clone(), http.clone(), config).await.unwrap();

    let key1 = EventKey::new(EventId(1), WebhookId(0));
    let key2 = EventKey::new(EventId(2), WebhookId(0));
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key1, WebhookId(0), "first", Headers::new())).await.unwrap();
    event_repo.create_event(webhook_dispatch::WebhookEvent::new(key2, WebhookId(0), "second", Headers::new())).await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;

    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Retrying { .. })),
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(http.call_count(), 1, "both events must have failed together as one batch");

    tokio::time::advance(Duration::from_millis(210)).await;
    wait_until(|| http.call_count() == 2, Duration::from_secs(2)).await;
    wait_until(|| event_repo.get(key1).map(|e| e.status) == Some(EventStatus::Delivered), Duration::from_secs(2)).await;
    assert_eq!(event_repo.get(key2).map(|e| e.status), Some(EventStatus::Delivered), "the retry must resend both events as one dispatch");
    wait_until(
        || matches!(state_repo.get_status_sync(WebhookId(0)), Some(WebhookStatus::Enabled)),
        Duration::from_secs(2),
    )
    .await;

    engine.shutdown().await;
}
