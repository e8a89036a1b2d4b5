//! Ingestion events carried by the notification fabric.
//!
//! Writers publish these after the store commit; the viewer fans them out to
//! WebSocket sessions and Web Push subscribers.

use crate::domain::MessageRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Message preview cap. One transport (Postgres NOTIFY) has an 8 KB payload
/// limit; the viewer fetches full content via the API anyway.
pub const PREVIEW_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    Edit,
    Delete,
    ChatUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub chat_id: i64,
    pub data: Value,
}

impl NotificationEvent {
    pub fn new_message(record: &MessageRecord) -> Self {
        Self {
            kind: NotificationKind::NewMessage,
            chat_id: record.chat_id,
            data: json!({ "message": message_preview(record) }),
        }
    }

    pub fn edit(chat_id: i64, message_id: i64, text: &str) -> Self {
        Self {
            kind: NotificationKind::Edit,
            chat_id,
            data: json!({
                "message": { "id": message_id, "text": truncate_preview(text) }
            }),
        }
    }

    pub fn delete(chat_id: i64, message_id: i64) -> Self {
        Self {
            kind: NotificationKind::Delete,
            chat_id,
            data: json!({ "message_id": message_id }),
        }
    }

    pub fn chat_update(chat_id: i64) -> Self {
        Self {
            kind: NotificationKind::ChatUpdate,
            chat_id,
            data: json!({}),
        }
    }
}

fn message_preview(record: &MessageRecord) -> Value {
    json!({
        "id": record.id,
        "chat_id": record.chat_id,
        "sender_id": record.sender_id,
        "date": record.date.and_utc().to_rfc3339(),
        "text": truncate_preview(&record.text),
        "media_type": record.media_type.map(|k| k.as_str()),
        "is_outgoing": record.is_outgoing as i64,
    })
}

/// Cap the body text at [`PREVIEW_MAX_CHARS`] characters, appending an
/// ellipsis marker when truncated. Operates on char boundaries.
pub fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_preview("hello"), "hello");
    }

    #[test]
    fn long_text_is_capped_with_ellipsis() {
        let text = "x".repeat(2000);
        let out = truncate_preview(&text);
        assert_eq!(out.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(PREVIEW_MAX_CHARS + 10);
        let out = truncate_preview(&text);
        assert_eq!(out.chars().count(), PREVIEW_MAX_CHARS + 1);
    }

    #[test]
    fn event_serialises_with_type_tag() {
        let event = NotificationEvent::delete(-100123456789, 7);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "delete");
        assert_eq!(value["chat_id"], -100123456789i64);
        assert_eq!(value["data"]["message_id"], 7);
    }
}
