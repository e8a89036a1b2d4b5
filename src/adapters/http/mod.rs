//! Read-only HTTP/WebSocket viewer.
//!
//! An inbound adapter over the store: REST endpoints, the WebSocket fan-out
//! fed by the notification fabric, and the Web Push bridge.

pub mod auth;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::build_router;
pub use state::ViewerState;

use crate::domain::NotificationKind;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bridge `new_message` events into Web Push deliveries. Runs for both
/// transports since everything lands on the broadcast hub.
pub fn spawn_push_bridge(state: Arc<ViewerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(push) = state.push.as_ref() else {
            return;
        };
        let mut events = state.events.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push bridge lagged behind the event hub");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if event.kind != NotificationKind::NewMessage {
                continue;
            }
            let chat_title = match state.store.get_chat(event.chat_id).await {
                Ok(Some(chat)) => chat.display_name(),
                _ => event.chat_id.to_string(),
            };
            let message = event.data.get("message");
            let text = message
                .and_then(|m| m.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let message_id = message
                .and_then(|m| m.get("id"))
                .and_then(|id| id.as_i64())
                .unwrap_or(0);
            let sent = push
                .notify_new_message(event.chat_id, &chat_title, None, text, message_id)
                .await;
            debug!(chat_id = event.chat_id, sent, "push bridge processed event");
        }
    })
}
