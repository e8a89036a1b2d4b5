//! Viewer entry point: wiring & DI only.
//!
//! The viewer is an independent read-only process: it serves the archive
//! over HTTP/WebSocket, receives ingestion events (native pub/sub on the
//! client/server store, the internal webhook otherwise) and bridges
//! new-message events into Web Push deliveries.

use anyhow::Context;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tg_archive::adapters::http::{ViewerState, build_router, spawn_push_bridge};
use tg_archive::adapters::notify::{PushManager, spawn_update_listener};
use tg_archive::adapters::persistence::connect_store;
use tg_archive::shared::{AppConfig, StoreSelection};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(AppConfig::load().context("configuration")?);
    let store = connect_store(&cfg.store)
        .await
        .context("store connection")?;

    let push = PushManager::initialize(&cfg, Arc::clone(&store))
        .await
        .context("push initialization")?;
    let state = ViewerState::new(Arc::clone(&cfg), store, push).await;

    // On the client/server store, ingestion events arrive over the native
    // pub/sub channel; the embedded store posts to /internal/push instead.
    if let StoreSelection::Postgres { conn_string } = &cfg.store {
        // Detached: the task reconnects forever and dies with the process.
        let _ = spawn_update_listener(conn_string.clone(), state.events.clone());
    }
    let _ = spawn_push_bridge(Arc::clone(&state));

    let router = build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.viewer_port)
        .parse()
        .context("viewer bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "viewer listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("serve")?;

    Ok(())
}
