//! WebSocket subscription router.
//!
//! Each session holds a set of subscribed chat ids; the empty set means
//! "everything". Events from the hub are delivered to matching sessions;
//! a failed send ends the session (the task, and with it the subscription
//! state, is reaped).

use crate::adapters::http::auth::require_auth;
use crate::adapters::http::state::ViewerState;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ClientAction {
    action: String,
    chat_id: Option<i64>,
}

pub async fn ws_updates(
    State(state): State<Arc<ViewerState>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    if let Err(status) = require_auth(state.auth.as_ref(), &headers) {
        return status.into_response();
    }
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<ViewerState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();
    let mut subscriptions: HashSet<i64> = HashSet::new();
    debug!("websocket session opened");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let reply = match serde_json::from_str::<ClientAction>(&text) {
                    Ok(action) => apply_action(&state, &mut subscriptions, action),
                    Err(_) => json!({ "type": "error", "message": "invalid action" }),
                };
                if sender.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket session lagged behind the event hub");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let wanted = subscriptions.is_empty() || subscriptions.contains(&event.chat_id);
                if !wanted || !state.display_allowed(event.chat_id) {
                    continue;
                }
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("websocket session closed");
}

fn apply_action(
    state: &ViewerState,
    subscriptions: &mut HashSet<i64>,
    action: ClientAction,
) -> serde_json::Value {
    match (action.action.as_str(), action.chat_id) {
        ("subscribe", Some(chat_id)) => {
            if !state.display_allowed(chat_id) {
                return json!({ "type": "error", "message": "access denied" });
            }
            subscriptions.insert(chat_id);
            json!({ "type": "subscribed", "chat_id": chat_id })
        }
        ("unsubscribe", Some(chat_id)) => {
            subscriptions.remove(&chat_id);
            json!({ "type": "unsubscribed", "chat_id": chat_id })
        }
        ("ping", _) => json!({ "type": "pong" }),
        _ => json!({ "type": "error", "message": "unknown action" }),
    }
}
