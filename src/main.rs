//! Archiver entry point: wiring & DI only.
//!
//! Bootstraps the store, the notification fabric and the Telegram gateway,
//! spawns the real-time listener when enabled, and drives backup runs on the
//! configured cron schedule (plus one run at startup). A tick that fires
//! while a run is still in progress is skipped by construction: the loop
//! only sleeps between runs.

use anyhow::Context;
use chrono::Utc;
use dotenv::dotenv;
use std::str::FromStr;
use std::sync::Arc;
use tg_archive::adapters::notify::make_notifier;
use tg_archive::adapters::persistence::connect_store;
use tg_archive::adapters::telegram::{GrammersTgGateway, session::open_file_session};
use tg_archive::adapters::media::MediaStore;
use tg_archive::ports::TgGateway;
use tg_archive::shared::AppConfig;
use tg_archive::usecases::{BackupService, Ingestor, ListenerService};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(AppConfig::load().context("configuration")?);
    cfg.validate_credentials().context("configuration")?;

    let schedule = parse_schedule(&cfg.schedule)
        .with_context(|| format!("invalid SCHEDULE '{}'", cfg.schedule))?;

    let store = connect_store(&cfg.store)
        .await
        .context("store connection")?;
    let notifier = make_notifier(&cfg, store.flavor());

    tokio::fs::create_dir_all(cfg.media_path())
        .await
        .context("create media directory")?;

    // --- Telegram client: one session shared by backup and listener; this
    // process owns it, so only this gateway may tear it down. ---
    let client = create_telegram_client(&cfg).await?;
    let gateway: Arc<dyn TgGateway> = Arc::new(GrammersTgGateway::new(client, true));
    match gateway.me().await {
        Ok(me) => info!(
            user_id = me.id,
            "connected as {}",
            me.first_name.as_deref().unwrap_or("<unknown>")
        ),
        Err(e) => {
            anyhow::bail!(
                "session not authorized ({e}); run the authentication setup first"
            );
        }
    }

    let media = MediaStore::new(cfg.media_path(), cfg.deduplicate_media);
    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&store),
        Arc::clone(&gateway),
        media,
        cfg.max_media_size_bytes(),
    ));
    let backup = BackupService::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&ingestor),
        Arc::clone(&cfg),
    );

    // --- Real-time listener (optional) ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_handle = if cfg.enable_listener {
        info!("real-time listener enabled");
        let mut listener = ListenerService::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&ingestor),
            Arc::clone(&cfg),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                error!(error = %e, "listener terminated with error");
            }
        }))
    } else {
        None
    };

    // --- Initial run, then cron ticks ---
    info!(schedule = %cfg.schedule, "running initial backup on startup");
    if let Err(e) = backup.run_backup().await {
        error!(error = %e, "initial backup failed");
    }

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("schedule yields no further runs");
            break;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(1));
        info!(next = %next, "next backup scheduled");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = backup.run_backup().await {
                    error!(error = %e, "scheduled backup failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = listener_handle {
        let _ = handle.await;
    }
    info!("archiver stopped");
    Ok(())
}

/// Parse the 5-field cron expression; the cron crate wants a seconds field,
/// so pin it to zero.
fn parse_schedule(expr: &str) -> anyhow::Result<cron::Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(Into::into)
}

/// Create the grammers client with persistent session storage. The session
/// must already be authorized (the interactive login flow is a separate
/// tool).
async fn create_telegram_client(cfg: &AppConfig) -> anyhow::Result<grammers_client::Client> {
    let api_id = cfg.api_id.expect("validated above");
    let session = open_file_session(cfg.session_path()).await?;
    let session = Arc::new(session);
    let pool = grammers_client::SenderPool::new(session, api_id);
    let handle = pool.handle.clone();
    tokio::spawn(async move {
        pool.runner.run().await;
    });
    Ok(grammers_client::Client::new(handle))
}
