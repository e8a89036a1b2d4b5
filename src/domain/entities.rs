//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here — these are mapped from adapters. Timestamps on
//! persisted records are UTC-naive; gateway types carry timezone-aware values
//! that the storage boundary normalises.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kind of dialog. Megagroups are stored as `group`, matching how users see
/// them; broadcast channels are `channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }

    pub fn from_str(s: &str) -> ChatKind {
        match s {
            "private" => ChatKind::Private,
            "channel" => ChatKind::Channel,
            _ => ChatKind::Group,
        }
    }
}

/// A chat row as persisted. `id` is always in the marked form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub description: Option<String>,
    pub participants_count: Option<i32>,
    #[serde(default)]
    pub last_synced_message_id: i64,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl ChatRecord {
    /// Human-readable chat name for logs and export filenames.
    pub fn display_name(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        self.username
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Chat listing row: the record plus activity info and the avatar URL the
/// viewer resolves from disk.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOverview {
    #[serde(flatten)]
    pub chat: ChatRecord,
    pub last_message_date: Option<NaiveDateTime>,
    pub avatar_url: Option<String>,
}

/// One page of the chat listing, with the unfiltered total for pagination.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPage {
    pub chats: Vec<ChatOverview>,
    pub total: u64,
}

/// A message sender. Insert-or-update on every message whose sender is a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub is_bot: bool,
}

/// Media classification, stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Animation,
    Sticker,
    Document,
    Contact,
    Geo,
    Poll,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
            MediaKind::Document => "document",
            MediaKind::Contact => "contact",
            MediaKind::Geo => "geo",
            MediaKind::Poll => "poll",
        }
    }

    pub fn from_str(s: &str) -> Option<MediaKind> {
        Some(match s {
            "photo" => MediaKind::Photo,
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "voice" => MediaKind::Voice,
            "animation" => MediaKind::Animation,
            "sticker" => MediaKind::Sticker,
            "document" => MediaKind::Document,
            "contact" => MediaKind::Contact,
            "geo" => MediaKind::Geo,
            "poll" => MediaKind::Poll,
            _ => return None,
        })
    }
}

/// Heterogeneous structured payload carried next to a message and persisted
/// as JSON text. Known shapes get typed fields; anything else survives in the
/// free-form bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawData {
    /// Album grouping id. Always the string form; older numeric values broke
    /// string comparison in the viewer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouped_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_from_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollData>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RawData {
    pub fn is_empty(&self) -> bool {
        self.grouped_id.is_none()
            && self.forward_from_name.is_none()
            && self.post_author.is_none()
            && self.poll.is_none()
            && self.extra.is_empty()
    }

    /// Serialise for persistence. Always yields an object, `{}` when empty.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(s: &str) -> RawData {
        serde_json::from_str(s).unwrap_or_default()
    }
}

/// Poll structure captured into `raw_data.poll`; polls are never downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollData {
    pub id: Option<i64>,
    pub question: String,
    pub answers: Vec<PollAnswer>,
    pub closed: bool,
    pub public_voters: bool,
    pub multiple_choice: bool,
    pub quiz: bool,
    pub results: Option<PollResults>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollAnswer {
    pub text: String,
    /// Raw option bytes, base64-encoded.
    pub option: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResults {
    pub total_voters: Option<i32>,
    pub results: Vec<PollAnswerVoters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollAnswerVoters {
    pub option: String,
    pub voters: i32,
    pub correct: Option<bool>,
}

/// A message row. Composite key `(id, chat_id)`: ids are only unique within
/// a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub date: NaiveDateTime,
    pub text: String,
    pub reply_to_msg_id: Option<i64>,
    /// Denormalised 100-char prefix of the replied message, when known.
    pub reply_to_text: Option<String>,
    pub forward_from_id: Option<i64>,
    pub edit_date: Option<NaiveDateTime>,
    pub media_type: Option<MediaKind>,
    pub media_id: Option<String>,
    pub media_path: Option<String>,
    pub raw_data: RawData,
    pub is_outgoing: bool,
}

/// A downloaded (or skipped) media file row. The id is the stable
/// `{chat_id}_{message_id}_{type}` identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub message_id: i64,
    pub chat_id: i64,
    pub kind: MediaKind,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<i32>,
    pub downloaded: bool,
    pub download_date: Option<NaiveDateTime>,
}

/// One reaction row as stored: either a concrete user's reaction
/// (`user_id = Some`, count 1) or an anonymous aggregate tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub emoji: String,
    pub user_id: Option<i64>,
    pub count: i64,
}

/// Per-message reaction aggregate as collected from the chat service and as
/// served to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: i64,
    pub user_ids: Vec<i64>,
}

/// Expand collected reaction summaries into stored rows: one row per known
/// user, plus an anonymous row carrying whatever the per-user rows cannot
/// account for.
pub fn expand_reactions(summaries: &[ReactionSummary]) -> Vec<ReactionRow> {
    let mut rows = Vec::new();
    for summary in summaries {
        if summary.user_ids.is_empty() {
            rows.push(ReactionRow {
                emoji: summary.emoji.clone(),
                user_id: None,
                count: summary.count.max(1),
            });
            continue;
        }
        for &user_id in &summary.user_ids {
            rows.push(ReactionRow {
                emoji: summary.emoji.clone(),
                user_id: Some(user_id),
                count: 1,
            });
        }
        let remaining = summary.count - summary.user_ids.len() as i64;
        if remaining > 0 {
            rows.push(ReactionRow {
                emoji: summary.emoji.clone(),
                user_id: None,
                count: remaining,
            });
        }
    }
    rows
}

/// Backup statistics, cached in metadata between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub chats: u64,
    pub messages: u64,
    pub media_files: u64,
    pub total_size_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_time_source: Option<String>,
}

/// Per-chat statistics for the viewer.
#[derive(Debug, Clone, Serialize)]
pub struct ChatStats {
    pub chat_id: i64,
    pub messages: u64,
    pub media_files: u64,
    pub first_message_date: Option<NaiveDateTime>,
    pub last_message_date: Option<NaiveDateTime>,
}

/// A Web Push subscription. A null `chat_id` subscribes to every chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionRecord {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub chat_id: Option<i64>,
    pub user_agent: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub last_used_at: Option<NaiveDateTime>,
}

/// Query for the paginated message listing. When both cursor fields are set,
/// rows strictly before the `(date, id)` tuple are returned, newest first.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub chat_id: i64,
    pub limit: u32,
    pub offset: u32,
    pub search: Option<String>,
    pub before_date: Option<NaiveDateTime>,
    pub before_id: Option<i64>,
}

/// A message as served by the viewer: the row joined with sender and media
/// info, with reactions grouped per emoji.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub date: NaiveDateTime,
    pub text: Option<String>,
    pub reply_to_msg_id: Option<i64>,
    pub reply_to_text: Option<String>,
    pub forward_from_id: Option<i64>,
    pub edit_date: Option<NaiveDateTime>,
    pub media_type: Option<String>,
    pub media_id: Option<String>,
    pub media_path: Option<String>,
    pub raw_data: Value,
    pub is_outgoing: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub media_file_name: Option<String>,
    pub media_mime_type: Option<String>,
    pub reactions: Vec<ReactionSummary>,
}

/// One export feed row.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub id: i64,
    pub date: Option<String>,
    pub sender: ExportSender,
    pub text: Option<String>,
    pub is_outgoing: bool,
    pub reply_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSender {
    pub name: String,
    pub username: Option<String>,
}

/// A dialog entity as seen by the gateway. `id` is already marked.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub description: Option<String>,
    pub participants_count: Option<i32>,
    /// Current profile photo id, when the entity has one. Drives avatar
    /// file naming.
    pub photo_id: Option<i64>,
    /// Bots are users on the wire but are admitted separately.
    pub is_bot: bool,
}

impl ChatInfo {
    pub fn to_record(&self) -> ChatRecord {
        ChatRecord {
            id: self.id,
            kind: self.kind,
            title: self.title.clone(),
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            phone: self.phone.clone(),
            description: self.description.clone(),
            participants_count: self.participants_count,
            last_synced_message_id: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.to_record().display_name()
    }
}

/// A dialog handle: the entity plus its last-activity time in epoch seconds
/// (epoch avoids tz-aware/naive comparison bugs when ordering).
#[derive(Debug, Clone)]
pub struct DialogInfo {
    pub chat: ChatInfo,
    pub last_activity: Option<i64>,
}

/// Forward header info extracted from a message.
#[derive(Debug, Clone, Default)]
pub struct ForwardInfo {
    pub from_id: Option<i64>,
    pub from_name: Option<String>,
}

/// Media attached to an incoming message, before download.
#[derive(Debug, Clone)]
pub struct IncomingMedia {
    /// Telegram file id; stable across chats, used for dedup and filenames.
    pub file_id: i64,
    pub kind: MediaKind,
    pub size: i64,
    pub mime_type: Option<String>,
    pub original_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<i32>,
}

/// A message as fetched from the chat service, before persistence.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: i64,
    pub chat_id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    pub sender: Option<UserRecord>,
    pub sender_id: Option<i64>,
    pub reply_to_msg_id: Option<i64>,
    pub forward: Option<ForwardInfo>,
    pub edit_date: Option<DateTime<Utc>>,
    pub outgoing: bool,
    pub grouped_id: Option<i64>,
    pub post_author: Option<String>,
    pub media: Option<IncomingMedia>,
    pub poll: Option<PollData>,
    pub reactions: Vec<ReactionSummary>,
}

/// A live update from the chat service, mapped for the listener.
#[derive(Debug, Clone)]
pub enum TelegramUpdate {
    NewMessage(IncomingMessage),
    MessageEdited(IncomingMessage),
    /// `chat_id` may be absent: some deletion events arrive without a peer.
    MessagesDeleted {
        chat_id: Option<i64>,
        message_ids: Vec<i64>,
    },
    /// Photo/title/member change in a chat.
    ChatAction { chat_id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_data_empty_serialises_to_object() {
        let raw = RawData::default();
        assert!(raw.is_empty());
        assert_eq!(raw.to_json(), "{}");
    }

    #[test]
    fn raw_data_round_trips_grouped_id_as_string() {
        let mut raw = RawData::default();
        raw.grouped_id = Some("13579246801234".into());
        let back = RawData::from_json(&raw.to_json());
        assert_eq!(back.grouped_id.as_deref(), Some("13579246801234"));
    }

    #[test]
    fn raw_data_keeps_unknown_fields() {
        let back = RawData::from_json(r#"{"grouped_id":"7","via_bot":12345}"#);
        assert_eq!(back.grouped_id.as_deref(), Some("7"));
        assert_eq!(back.extra.get("via_bot"), Some(&Value::from(12345)));
    }

    #[test]
    fn expand_reactions_splits_users_and_remainder() {
        let rows = expand_reactions(&[ReactionSummary {
            emoji: "👍".into(),
            count: 5,
            user_ids: vec![1, 2],
        }]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].user_id, Some(1));
        assert_eq!(rows[1].user_id, Some(2));
        assert_eq!(rows[2], ReactionRow { emoji: "👍".into(), user_id: None, count: 3 });
    }

    #[test]
    fn expand_reactions_anonymous_only() {
        let rows = expand_reactions(&[ReactionSummary {
            emoji: "🔥".into(),
            count: 4,
            user_ids: vec![],
        }]);
        assert_eq!(rows, vec![ReactionRow { emoji: "🔥".into(), user_id: None, count: 4 }]);
    }

    #[test]
    fn chat_display_name_prefers_title_then_names() {
        let mut chat = ChatRecord {
            id: 42,
            kind: ChatKind::Private,
            title: None,
            username: Some("alice".into()),
            first_name: Some("Alice".into()),
            last_name: None,
            phone: None,
            description: None,
            participants_count: None,
            last_synced_message_id: 0,
            created_at: None,
            updated_at: None,
        };
        assert_eq!(chat.display_name(), "Alice");
        chat.first_name = None;
        assert_eq!(chat.display_name(), "alice");
    }
}
