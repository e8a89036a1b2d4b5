//! Viewer-side LISTEN task for the client/server store.
//!
//! Holds a dedicated long-lived connection subscribed to the update channel
//! and forwards payloads into the viewer's broadcast hub. Reconnects with a
//! fixed 5 s backoff on any failure.

use crate::adapters::notify::publisher::NOTIFY_CHANNEL;
use crate::domain::NotificationEvent;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Spawn the LISTEN loop. Runs until the viewer process exits.
pub fn spawn_update_listener(
    conn_string: String,
    events: broadcast::Sender<NotificationEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listen_once(&conn_string, &events).await {
                Ok(()) => warn!("pub/sub listener stream ended, reconnecting"),
                Err(e) => warn!(error = %e, "pub/sub listener failed, reconnecting"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn listen_once(
    conn_string: &str,
    events: &broadcast::Sender<NotificationEvent>,
) -> Result<(), tokio_postgres::Error> {
    let (client, mut connection) = tokio_postgres::connect(conn_string, NoTls).await?;
    let mut stream = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));

    // The connection future must be polled for LISTEN to make progress, so
    // both run under one select.
    let listen_sql = format!(r#"LISTEN "{NOTIFY_CHANNEL}""#);
    let listen = client.batch_execute(&listen_sql);
    tokio::pin!(listen);
    let mut listening = false;

    loop {
        tokio::select! {
            result = &mut listen, if !listening => {
                result?;
                listening = true;
                info!(channel = NOTIFY_CHANNEL, "pub/sub listener connected");
            }
            message = stream.next() => {
                match message {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        match serde_json::from_str::<NotificationEvent>(n.payload()) {
                            Ok(event) => {
                                debug!(chat_id = event.chat_id, "pub/sub event received");
                                let _ = events.send(event);
                            }
                            Err(e) => warn!(error = %e, "invalid pub/sub payload"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
        }
    }
}
