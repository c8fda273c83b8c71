//! Demo binary: wires the in-memory repository doubles and a `reqwest`-backed
//! `HttpClient` into an [`Engine`], and runs until Ctrl-C / SIGTERM.
//!
//! Grounded on `dwctl/src/main.rs`'s bootstrap sequence (parse args, load config,
//! init tracing, construct the application, run until a shutdown signal).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use webhook_dispatch::config::{Args, Config};
use webhook_dispatch::testing::{InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo};
use webhook_dispatch::{Batching, DeliveryMode, Engine, ReqwestHttpClient, Semantics, Webhook, WebhookId, WebhookStatus};

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down gracefully..."),
        _ = terminate => tracing::info!("received SIGTERM, shutting down gracefully..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("configuration is valid");
        return Ok(());
    }

    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    tracing::debug!(?args, "starting webhook-dispatchd");

    // Demo registration: a single batched, at-least-once webhook pointed at the
    // `test-endpoint` binary's default address. A real deployment supplies its own
    // `WebhookRepo` backed by durable storage instead.
    let webhook_repo = Arc::new(InMemoryWebhookRepo::new([Webhook {
        id: WebhookId(1),
        url: "http://127.0.0.1:8787/webhook".to_string(),
        label: "demo".to_string(),
        status: WebhookStatus::Enabled,
        delivery_mode: DeliveryMode::new(Batching::Batched, Semantics::AtLeastOnce),
    }]));
    let event_repo = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    state_repo.operator_set_status(WebhookId(1), WebhookStatus::Enabled);
    let http = Arc::new(ReqwestHttpClient::new());

    let engine = Engine::start(webhook_repo, event_repo, state_repo, http, config.into()).await?;

    let mut errors = engine.errors();
    tokio::spawn(async move {
        while let Ok(event) = errors.recv().await {
            tracing::warn!(?event.webhook_id, error = %event.error, "dispatch error");
        }
    });

    shutdown_signal().await;
    tokio::time::timeout(Duration::from_secs(35), engine.shutdown()).await.ok();

    Ok(())
}
