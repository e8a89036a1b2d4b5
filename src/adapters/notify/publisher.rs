//! Event publishers. One per transport; both are fire-and-forget.
//!
//! A failed publish is a warning, never an error: the originating write has
//! already committed and must not be rolled back or retried because a viewer
//! was unreachable.

use crate::domain::NotificationEvent;
use crate::ports::{NotifierPort, StoreFlavor};
use crate::shared::{AppConfig, StoreSelection};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Pub/sub channel on the client/server store.
pub const NOTIFY_CHANNEL: &str = "telegram_updates";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Webhook publisher for the embedded store: POSTs events to the viewer's
/// `/internal/push` endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        info!(endpoint = %endpoint, "realtime notifier: HTTP webhook transport");
        Self { client, endpoint }
    }
}

#[async_trait::async_trait]
impl NotifierPort for HttpNotifier {
    async fn publish(&self, event: &NotificationEvent) {
        let result = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(chat_id = event.chat_id, "notification delivered via webhook");
            }
            Ok(response) => {
                warn!(status = %response.status(), "webhook notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "webhook notification failed");
            }
        }
    }
}

/// Native pub/sub publisher for the client/server store.
pub struct PgNotifier {
    pool: Pool,
}

impl PgNotifier {
    pub fn connect(conn_string: &str) -> Result<Self, String> {
        let pg_config = tokio_postgres::Config::from_str(conn_string).map_err(|e| e.to_string())?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(2)
            .build()
            .map_err(|e| e.to_string())?;
        info!(channel = NOTIFY_CHANNEL, "realtime notifier: pub/sub transport");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl NotifierPort for PgNotifier {
    async fn publish(&self, event: &NotificationEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "notification payload not serialisable");
                return;
            }
        };
        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "pub/sub notification: no connection");
                return;
            }
        };
        if let Err(e) = client
            .execute("SELECT pg_notify($1, $2)", &[&NOTIFY_CHANNEL, &payload])
            .await
        {
            warn!(error = %e, "pub/sub notification failed");
        } else {
            debug!(chat_id = event.chat_id, "notification delivered via pub/sub");
        }
    }
}

/// Silent sink for setups that have no viewer to notify.
pub struct NoopNotifier;

#[async_trait::async_trait]
impl NotifierPort for NoopNotifier {
    async fn publish(&self, _event: &NotificationEvent) {}
}

/// Pick the transport matching the store flavour.
pub fn make_notifier(cfg: &AppConfig, flavor: StoreFlavor) -> Arc<dyn NotifierPort> {
    match (&cfg.store, flavor) {
        (StoreSelection::Postgres { conn_string }, StoreFlavor::Postgres) => {
            match PgNotifier::connect(conn_string) {
                Ok(notifier) => Arc::new(notifier),
                Err(e) => {
                    warn!(error = %e, "pub/sub notifier unavailable, notifications disabled");
                    Arc::new(NoopNotifier)
                }
            }
        }
        _ => Arc::new(HttpNotifier::new(cfg.internal_push_url())),
    }
}
