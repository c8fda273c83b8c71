//! Standalone receiver for exercising a running dispatch engine by hand: logs
//! every POSTed delivery (single or batched) and returns 200.
//!
//! Grounded on `batcher/src/main.rs`'s axum bootstrap (`axum::serve` over a
//! `tokio::net::TcpListener`); this crate's core treats "the embedded test HTTP
//! endpoint" as out of scope (spec.md §1), so it lives here as a separate binary.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct AppState {
    received: AtomicU64,
}

async fn webhook(State(state): State<Arc<AppState>>, headers: HeaderMap, body: String) -> StatusCode {
    let count = state.received.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(
        delivery_number = count,
        content_type = ?headers.get("content-type"),
        body = %body,
        "received webhook delivery"
    );
    StatusCode::OK
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new("test_endpoint=debug,info")).init();

    let state = Arc::new(AppState::default());
    let app = Router::new().route("/webhook", post(webhook)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8787").await?;
    tracing::info!("test endpoint listening on http://127.0.0.1:8787/webhook");
    axum::serve(listener, app).await?;

    Ok(())
}
