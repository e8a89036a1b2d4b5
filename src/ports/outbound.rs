//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    ChatInfo, DialogInfo, DomainError, IncomingMessage, NotificationEvent, TelegramUpdate,
    UserRecord,
};
use std::path::Path;

/// Telegram API gateway. Fetch dialogs, messages, media; stream updates.
///
/// All chat ids crossing this boundary are in the marked form.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TgGateway: Send + Sync {
    /// The authenticated account.
    async fn me(&self) -> Result<UserRecord, DomainError>;

    /// Every dialog the account participates in, with last-activity epoch
    /// seconds for recency ordering.
    async fn get_dialogs(&self) -> Result<Vec<DialogInfo>, DomainError>;

    /// Fetch a single entity by marked id. Used for include-listed chats
    /// that did not appear in the dialog enumeration and for chat-action
    /// refreshes.
    async fn get_entity(&self, chat_id: i64) -> Result<ChatInfo, DomainError>;

    /// Fetch up to `limit` messages with `id > after_id`, ascending. An
    /// empty result means the chat has no newer messages.
    async fn fetch_messages_after(
        &self,
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, DomainError>;

    /// Fetch messages by id. `None` entries mark messages deleted upstream;
    /// the order matches the input ids.
    async fn get_messages_by_id(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<IncomingMessage>>, DomainError>;

    /// Download the media of a message to the given path.
    async fn download_media(
        &self,
        chat_id: i64,
        message_id: i64,
        dest: &Path,
    ) -> Result<(), DomainError>;

    /// Download the current profile photo. Returns false when the entity has
    /// no photo set.
    async fn download_profile_photo(
        &self,
        chat_id: i64,
        dest: &Path,
    ) -> Result<bool, DomainError>;

    /// Next update from the long-lived event stream. `None` means the
    /// stream ended (session closed).
    async fn next_update(&self) -> Result<Option<TelegramUpdate>, DomainError>;

    /// Whether the underlying session is connected. Non-owners of a shared
    /// session verify connectedness instead of connecting themselves.
    async fn is_connected(&self) -> bool;

    /// Tear down the session. Only the session owner may call this.
    async fn disconnect(&self);
}

/// Publishes ingestion events to reader processes. Delivery failures are
/// logged and never propagate into the originating write.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait NotifierPort: Send + Sync {
    async fn publish(&self, event: &NotificationEvent);
}
