//! Storage port. One contract over both store dialects.
//!
//! Implementations exist for the embedded single-writer file store (SQLite)
//! and the client/server relational store (PostgreSQL). Semantics must be
//! identical; dialect differences (upserts, concurrency, pub/sub) stay
//! behind this trait.

use crate::domain::{
    ChatPage, ChatRecord, ChatStats, DomainError, MediaRecord, MessageQuery, MessageRecord,
    MessageView, PushSubscriptionRecord, ReactionRow, Statistics, UserRecord,
};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::Path;

/// Store dialect. Drives notification transport selection at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFlavor {
    Sqlite,
    Postgres,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait StorePort: Send + Sync {
    fn flavor(&self) -> StoreFlavor;

    // ----- chats -----

    async fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), DomainError>;

    async fn get_chat(&self, chat_id: i64) -> Result<Option<ChatRecord>, DomainError>;

    /// Listing for the viewer: ordered by last message date descending,
    /// chats without messages last. `search` is a case-insensitive substring
    /// match on the display fields.
    async fn get_all_chats(
        &self,
        limit: Option<u32>,
        offset: u32,
        search: Option<&str>,
    ) -> Result<ChatPage, DomainError>;

    /// Every chat id in the store. Seeds the listener's tracked set.
    async fn get_all_chat_ids(&self) -> Result<Vec<i64>, DomainError>;

    /// Remove the chat and everything it owns: messages, reactions, media
    /// rows, sync status, plus the chat's media directory and avatar files
    /// when `media_root` is given.
    async fn delete_chat_and_related_data(
        &self,
        chat_id: i64,
        media_root: Option<&Path>,
    ) -> Result<(), DomainError>;

    // ----- users -----

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), DomainError>;

    // ----- messages -----

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), DomainError>;

    /// Idempotent batch upsert in one transaction: re-inserting the same
    /// `(id, chat_id)` overwrites the prior row.
    async fn insert_messages_batch(&self, messages: &[MessageRecord]) -> Result<(), DomainError>;

    async fn update_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        edit_date: Option<NaiveDateTime>,
    ) -> Result<(), DomainError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DomainError>;

    /// Deletion-without-chat fallback for listener events that arrive
    /// without a peer. Returns true when at least one row went away.
    async fn delete_message_by_id_any_chat(&self, message_id: i64) -> Result<bool, DomainError>;

    /// Set `is_outgoing=1` on historical messages sent by the owner.
    /// Returns the number of rows touched.
    async fn backfill_outgoing(&self, owner_id: i64) -> Result<u64, DomainError>;

    async fn get_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<String>, DomainError>;

    /// Paginated listing with user/media joins, reactions, reply-text
    /// backfill. Supports offset pagination and strict `(date, id)` tuple
    /// cursors (`before_date` + `before_id`), newest first.
    async fn get_messages_paginated(
        &self,
        query: &MessageQuery,
    ) -> Result<Vec<MessageView>, DomainError>;

    /// Jump-to-date: first message at or after the target, else the last one
    /// before it, else the first in the chat.
    async fn find_message_by_date_with_joins(
        &self,
        chat_id: i64,
        target: NaiveDateTime,
    ) -> Result<Option<MessageView>, DomainError>;

    /// Keyset-paged ascending export feed. Pass the last row's `(date, id)`
    /// to advance; `(None, 0)` starts from the beginning.
    async fn get_export_page(
        &self,
        chat_id: i64,
        after_date: Option<NaiveDateTime>,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<crate::domain::ExportRow>, DomainError>;

    /// Message id -> local edit date, for deletion/edit reconciliation.
    async fn get_messages_sync_data(
        &self,
        chat_id: i64,
    ) -> Result<HashMap<i64, Option<NaiveDateTime>>, DomainError>;

    // ----- media -----

    async fn insert_media(&self, media: &MediaRecord) -> Result<(), DomainError>;

    /// Rows that should have a file on disk: `downloaded=1 OR file_path IS
    /// NOT NULL`, ordered by chat then message for batched re-fetching.
    async fn get_media_for_verification(&self) -> Result<Vec<MediaRecord>, DomainError>;

    /// Flip a row to `downloaded=0` with nulled path and download date.
    async fn mark_media_for_redownload(&self, media_id: &str) -> Result<(), DomainError>;

    // ----- reactions -----

    /// Delete-then-insert within one transaction; the final state equals the
    /// supplied set.
    async fn insert_reactions(
        &self,
        message_id: i64,
        chat_id: i64,
        reactions: &[ReactionRow],
    ) -> Result<(), DomainError>;

    async fn get_reactions(
        &self,
        message_id: i64,
        chat_id: i64,
    ) -> Result<Vec<ReactionRow>, DomainError>;

    // ----- sync status -----

    async fn get_last_message_id(&self, chat_id: i64) -> Result<i64, DomainError>;

    /// Atomic upsert: sets the cursor and increments `message_count` by the
    /// supplied delta. Two concurrent callers must not lose increments.
    async fn update_sync_status(
        &self,
        chat_id: i64,
        last_message_id: i64,
        increment: i64,
    ) -> Result<(), DomainError>;

    // ----- metadata & statistics -----

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), DomainError>;

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, DomainError>;

    async fn delete_metadata(&self, key: &str) -> Result<(), DomainError>;

    /// Compute fresh statistics from the tables. `last_backup_time` comes
    /// from metadata, falling back to the newest sync date.
    async fn compute_statistics(&self) -> Result<Statistics, DomainError>;

    async fn chat_statistics(&self, chat_id: i64) -> Result<ChatStats, DomainError>;

    async fn health_check(&self) -> Result<(), DomainError>;

    // ----- push subscriptions -----

    async fn upsert_push_subscription(
        &self,
        sub: &PushSubscriptionRecord,
    ) -> Result<(), DomainError>;

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<(), DomainError>;

    /// Subscriptions matching the chat: chat-specific ones plus globals
    /// (`chat_id IS NULL`). `None` returns everything.
    async fn get_push_subscriptions(
        &self,
        chat_id: Option<i64>,
    ) -> Result<Vec<PushSubscriptionRecord>, DomainError>;
}
