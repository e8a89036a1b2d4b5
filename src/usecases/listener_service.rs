//! Real-time event listener.
//!
//! Long-lived loop over the gateway's update stream: edits, deletions, new
//! messages, albums and chat actions, each gated by its own toggle and by
//! per-chat admission (tracked set or explicit include lists). Destructive
//! operations pass through the burst protector so a mass edit/delete can
//! damage at most one threshold's worth of rows per window. Events preserve
//! per-chat arrival order; everything is processed on this single task.

use crate::adapters::persistence::keys;
use crate::domain::{
    ChatKind, ChatRecord, DomainError, IncomingMessage, NotificationEvent, TelegramUpdate, peer,
};
use crate::ports::{NotifierPort, StorePort, TgGateway};
use crate::shared::AppConfig;
use crate::shared::time::to_utc_naive_opt;
use crate::usecases::burst_protector::{BurstProtector, OperationKind};
use crate::usecases::ingest::Ingestor;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Quiescence window after which a pending album flushes.
const ALBUM_FLUSH_DELAY: Duration = Duration::from_millis(800);

#[derive(Debug, Default, Clone)]
pub struct ListenerStats {
    pub new_messages_processed: u64,
    pub edits_processed: u64,
    pub deletions_processed: u64,
    pub deletions_skipped: u64,
    pub albums_processed: u64,
    pub chat_updates_processed: u64,
    pub errors: u64,
}

pub struct ListenerService {
    gateway: Arc<dyn TgGateway>,
    store: Arc<dyn StorePort>,
    notifier: Arc<dyn NotifierPort>,
    ingestor: Arc<Ingestor>,
    cfg: Arc<AppConfig>,
    protector: BurstProtector,
    tracked: HashSet<i64>,
    include_ids: HashSet<i64>,
    stats: ListenerStats,
}

impl ListenerService {
    pub fn new(
        gateway: Arc<dyn TgGateway>,
        store: Arc<dyn StorePort>,
        notifier: Arc<dyn NotifierPort>,
        ingestor: Arc<Ingestor>,
        cfg: Arc<AppConfig>,
    ) -> Self {
        let protector = BurstProtector::new(
            cfg.mass_operation_threshold,
            Duration::from_secs(cfg.mass_operation_window_seconds),
        );
        if cfg.mass_operation_buffer_delay.is_some() {
            info!("MASS_OPERATION_BUFFER_DELAY is set but unused; the sliding-window limiter applies");
        }
        let include_ids = cfg.all_include_ids();
        Self {
            gateway,
            store,
            notifier,
            ingestor,
            cfg,
            protector,
            tracked: HashSet::new(),
            include_ids,
            stats: ListenerStats::default(),
        }
    }

    /// Run until the shutdown signal flips or the update stream ends.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DomainError> {
        self.load_tracked_chats().await;
        self.store
            .set_metadata(
                keys::LISTENER_ACTIVE_SINCE,
                &format!("{}Z", Utc::now().format("%Y-%m-%dT%H:%M:%S")),
            )
            .await?;
        info!(
            tracked = self.tracked.len(),
            "real-time listener started"
        );

        // The update future must not borrow `self`, or the handler calls in
        // the arm bodies could not take `&mut self`.
        let gateway = Arc::clone(&self.gateway);
        let mut pending_album: Vec<IncomingMessage> = Vec::new();
        loop {
            let flush_timer = tokio::time::sleep(ALBUM_FLUSH_DELAY);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = flush_timer, if !pending_album.is_empty() => {
                    let album = std::mem::take(&mut pending_album);
                    self.handle_album(album).await;
                }
                update = gateway.next_update() => match update {
                    Ok(Some(update)) => self.dispatch(update, &mut pending_album).await,
                    Ok(None) => {
                        warn!("update stream ended");
                        break;
                    }
                    Err(e) => {
                        self.stats.errors += 1;
                        error!(error = %e, "update stream error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        if !pending_album.is_empty() {
            let album = std::mem::take(&mut pending_album);
            self.handle_album(album).await;
        }
        self.finish().await;
        Ok(())
    }

    async fn finish(&mut self) {
        let _ = self.store.delete_metadata(keys::LISTENER_ACTIVE_SINCE).await;
        let now = Instant::now();
        let protector = self.protector.stats();
        info!(
            new_messages = self.stats.new_messages_processed,
            edits = self.stats.edits_processed,
            deletions = self.stats.deletions_processed,
            deletions_skipped = self.stats.deletions_skipped,
            albums = self.stats.albums_processed,
            chat_updates = self.stats.chat_updates_processed,
            errors = self.stats.errors,
            ops_allowed = protector.ops_allowed,
            ops_blocked = protector.ops_blocked,
            rate_limits_triggered = protector.rate_limits_triggered,
            chats_ever_limited = protector.chats_ever_limited.len(),
            chats_currently_blocked = self.protector.currently_blocked(now).len(),
            "listener stopped"
        );
        // Only the session owner tears the connection down; the gateway
        // enforces the shared-session discipline.
        self.gateway.disconnect().await;
    }

    async fn load_tracked_chats(&mut self) {
        match self.store.get_all_chat_ids().await {
            Ok(ids) => self.tracked = ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "could not load tracked chats");
                self.tracked = HashSet::new();
            }
        }
    }

    /// Admission: previously seen chats, plus explicit includes. Chat type
    /// is unknowable without fetching the entity, so unseen chats are only
    /// admitted when include-listed.
    fn should_process(&self, chat_id: i64) -> bool {
        self.tracked.contains(&chat_id) || self.include_ids.contains(&chat_id)
    }

    async fn dispatch(&mut self, update: TelegramUpdate, pending_album: &mut Vec<IncomingMessage>) {
        match update {
            TelegramUpdate::NewMessage(msg) => {
                if msg.grouped_id.is_some() && self.cfg.listen_albums {
                    // Album members arrive back to back; flush when the
                    // group id changes, otherwise buffer until quiescence.
                    let same_group = pending_album
                        .first()
                        .map(|first| first.grouped_id == msg.grouped_id)
                        .unwrap_or(true);
                    if !same_group {
                        let album = std::mem::take(pending_album);
                        self.handle_album(album).await;
                    }
                    pending_album.push(msg);
                    return;
                }
                self.handle_new_message(msg).await;
            }
            TelegramUpdate::MessageEdited(msg) => {
                if !pending_album.is_empty() {
                    let album = std::mem::take(pending_album);
                    self.handle_album(album).await;
                }
                self.handle_edit(msg).await;
            }
            TelegramUpdate::MessagesDeleted { chat_id, message_ids } => {
                if !pending_album.is_empty() {
                    let album = std::mem::take(pending_album);
                    self.handle_album(album).await;
                }
                self.handle_deletions(chat_id, message_ids).await;
            }
            TelegramUpdate::ChatAction { chat_id } => {
                self.handle_chat_action(chat_id).await;
            }
        }
    }

    /// Track the chat, then persist the message when enabled.
    pub(crate) async fn handle_new_message(&mut self, msg: IncomingMessage) {
        let chat_id = msg.chat_id;
        let admitted = self.should_process(chat_id);
        if admitted && self.tracked.insert(chat_id) {
            debug!(chat_id, "chat added to tracking list");
        }
        if !self.cfg.listen_new_messages || !admitted {
            return;
        }
        let download = self.cfg.download_media && self.cfg.listen_new_messages_media;
        match self.persist_message(&msg, download).await {
            Ok(record) => {
                self.stats.new_messages_processed += 1;
                self.notifier
                    .publish(&NotificationEvent::new_message(&record))
                    .await;
                debug!(chat_id, msg_id = msg.id, "new message archived");
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(chat_id, msg_id = msg.id, error = %e, "failed to archive new message");
            }
        }
    }

    /// Persist one incoming message: chat upsert first so the row always has
    /// a parent, then the record and its reactions.
    async fn persist_message(
        &self,
        msg: &IncomingMessage,
        download_media: bool,
    ) -> Result<crate::domain::MessageRecord, DomainError> {
        self.upsert_chat_for(msg.chat_id).await?;
        let record = self.ingestor.process_message(msg, download_media).await?;
        self.store.insert_message(&record).await?;
        let reactions = Ingestor::reaction_rows(msg);
        if !reactions.is_empty() {
            self.store
                .insert_reactions(record.id, record.chat_id, &reactions)
                .await?;
        }
        Ok(record)
    }

    async fn upsert_chat_for(&self, chat_id: i64) -> Result<(), DomainError> {
        let record = match self.gateway.get_entity(chat_id).await {
            Ok(info) => info.to_record(),
            Err(e) => {
                debug!(chat_id, error = %e, "entity not resolvable, storing minimal chat row");
                minimal_chat_record(chat_id)
            }
        };
        self.store.upsert_chat(&record).await
    }

    pub(crate) async fn handle_edit(&mut self, msg: IncomingMessage) {
        if !self.cfg.listen_edits {
            return;
        }
        let chat_id = msg.chat_id;
        if !self.should_process(chat_id) {
            return;
        }
        if !self
            .protector
            .check(chat_id, OperationKind::Edit, Instant::now())
            .is_allowed()
        {
            return;
        }
        let edit_date = to_utc_naive_opt(msg.edit_date);
        match self
            .store
            .update_message_text(chat_id, msg.id, &msg.text, edit_date)
            .await
        {
            Ok(()) => {
                self.stats.edits_processed += 1;
                self.notifier
                    .publish(&NotificationEvent::edit(chat_id, msg.id, &msg.text))
                    .await;
                info!(chat_id, msg_id = msg.id, "edit applied");
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(chat_id, msg_id = msg.id, error = %e, "edit failed");
            }
        }
    }

    pub(crate) async fn handle_deletions(&mut self, chat_id: Option<i64>, message_ids: Vec<i64>) {
        if !self.cfg.listen_deletions {
            self.stats.deletions_skipped += message_ids.len() as u64;
            return;
        }
        if let Some(chat_id) = chat_id {
            if !self.should_process(chat_id) {
                return;
            }
        }
        for message_id in message_ids {
            // Deletions that arrive without a peer share one protector
            // bucket; they cannot be attributed until the store lookup.
            let bucket = chat_id.unwrap_or(0);
            if !self
                .protector
                .check(bucket, OperationKind::Delete, Instant::now())
                .is_allowed()
            {
                continue;
            }
            let outcome = match chat_id {
                Some(chat_id) => self
                    .store
                    .delete_message(chat_id, message_id)
                    .await
                    .map(|_| true),
                None => self.store.delete_message_by_id_any_chat(message_id).await,
            };
            match outcome {
                Ok(applied) => {
                    if applied {
                        self.stats.deletions_processed += 1;
                        self.notifier
                            .publish(&NotificationEvent::delete(bucket, message_id))
                            .await;
                        info!(chat_id = bucket, msg_id = message_id, "deletion applied");
                    }
                }
                Err(e) => {
                    self.stats.errors += 1;
                    error!(msg_id = message_id, error = %e, "deletion failed");
                }
            }
        }
    }

    /// An album is one logical upload: every member keeps its real media
    /// type, the group id ties them together, and the batch persists
    /// atomically.
    pub(crate) async fn handle_album(&mut self, album: Vec<IncomingMessage>) {
        let Some(first) = album.first() else { return };
        let chat_id = first.chat_id;
        let admitted = self.should_process(chat_id);
        if admitted && self.tracked.insert(chat_id) {
            debug!(chat_id, "chat added to tracking list");
        }
        if !self.cfg.listen_new_messages || !admitted {
            return;
        }
        if let Err(e) = self.upsert_chat_for(chat_id).await {
            self.stats.errors += 1;
            error!(chat_id, error = %e, "album chat upsert failed");
            return;
        }

        let download = self.cfg.download_media && self.cfg.listen_new_messages_media;
        let mut records = Vec::with_capacity(album.len());
        for msg in &album {
            match self.ingestor.process_message(msg, download).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.stats.errors += 1;
                    error!(chat_id, msg_id = msg.id, error = %e, "album member failed");
                }
            }
        }
        if records.is_empty() {
            return;
        }
        match self.store.insert_messages_batch(&records).await {
            Ok(()) => {
                self.stats.albums_processed += 1;
                self.stats.new_messages_processed += records.len() as u64;
                for record in &records {
                    self.notifier
                        .publish(&NotificationEvent::new_message(record))
                        .await;
                }
                info!(chat_id, members = records.len(), "album archived");
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(chat_id, error = %e, "album batch insert failed");
            }
        }
    }

    pub(crate) async fn handle_chat_action(&mut self, chat_id: i64) {
        if !self.cfg.listen_chat_actions || !self.should_process(chat_id) {
            return;
        }
        match self.upsert_chat_for(chat_id).await {
            Ok(()) => {
                self.stats.chat_updates_processed += 1;
                self.notifier
                    .publish(&NotificationEvent::chat_update(chat_id))
                    .await;
                info!(chat_id, "chat action applied");
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(chat_id, error = %e, "chat action failed");
            }
        }
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }
}

fn minimal_chat_record(chat_id: i64) -> ChatRecord {
    let kind = if chat_id > 0 {
        ChatKind::Private
    } else if peer::is_channel_marked(chat_id) {
        ChatKind::Channel
    } else {
        ChatKind::Group
    };
    ChatRecord {
        id: chat_id,
        kind,
        title: None,
        username: None,
        first_name: None,
        last_name: None,
        phone: None,
        description: None,
        participants_count: None,
        last_synced_message_id: 0,
        created_at: None,
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::media::MediaStore;
    use crate::ports::{MockNotifierPort, MockStorePort, MockTgGateway};
    use crate::shared::config::tests_support::base_config;
    use chrono::{TimeZone, Utc};
    use mockall::predicate::eq;

    const CHAT: i64 = -100987654321;

    fn incoming(id: i64) -> IncomingMessage {
        IncomingMessage {
            id,
            chat_id: CHAT,
            date: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
            text: format!("message {id}"),
            sender: None,
            sender_id: Some(1001),
            reply_to_msg_id: None,
            forward: None,
            edit_date: None,
            outgoing: false,
            grouped_id: None,
            post_author: None,
            media: None,
            poll: None,
            reactions: Vec::new(),
        }
    }

    fn listener(
        cfg: AppConfig,
        store: MockStorePort,
        gateway: MockTgGateway,
        notifier: MockNotifierPort,
    ) -> ListenerService {
        let store: Arc<dyn StorePort> = Arc::new(store);
        let gateway: Arc<dyn TgGateway> = Arc::new(gateway);
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            MediaStore::new(dir.path(), true),
            100 * 1024 * 1024,
        ));
        let mut service = ListenerService::new(
            gateway,
            store,
            Arc::new(notifier),
            ingestor,
            Arc::new(cfg),
        );
        service.tracked.insert(CHAT);
        service
    }

    #[tokio::test]
    async fn mass_deletion_is_capped_at_threshold() {
        let mut store = MockStorePort::new();
        store
            .expect_delete_message()
            .times(10)
            .returning(|_, _| Ok(()));
        let mut notifier = MockNotifierPort::new();
        notifier.expect_publish().times(10).return_const(());

        let mut service = listener(base_config(), store, MockTgGateway::new(), notifier);
        let ids: Vec<i64> = (1..=50).collect();
        service.handle_deletions(Some(CHAT), ids).await;

        assert_eq!(service.stats().deletions_processed, 10);
        assert_eq!(service.protector.stats().ops_blocked, 40);
        assert!(service.protector.is_blocked(CHAT, Instant::now()));
    }

    #[tokio::test]
    async fn deletions_skipped_when_disabled() {
        let mut cfg = base_config();
        cfg.listen_deletions = false;
        let mut store = MockStorePort::new();
        store.expect_delete_message().never();

        let mut service = listener(cfg, store, MockTgGateway::new(), MockNotifierPort::new());
        service.handle_deletions(Some(CHAT), (1..=50).collect()).await;

        assert_eq!(service.stats().deletions_skipped, 50);
        assert_eq!(service.stats().deletions_processed, 0);
        assert!(!service.protector.is_blocked(CHAT, Instant::now()));
    }

    #[tokio::test]
    async fn deletion_without_chat_falls_back_to_store_scan() {
        let mut store = MockStorePort::new();
        store
            .expect_delete_message_by_id_any_chat()
            .with(eq(77))
            .times(1)
            .returning(|_| Ok(true));
        let mut notifier = MockNotifierPort::new();
        notifier.expect_publish().times(1).return_const(());

        let mut service = listener(base_config(), store, MockTgGateway::new(), notifier);
        service.handle_deletions(None, vec![77]).await;
        assert_eq!(service.stats().deletions_processed, 1);
    }

    #[tokio::test]
    async fn edits_respect_the_toggle_and_admission() {
        let mut cfg = base_config();
        cfg.listen_edits = false;
        let mut store = MockStorePort::new();
        store.expect_update_message_text().never();
        let mut service = listener(cfg, store, MockTgGateway::new(), MockNotifierPort::new());
        service.handle_edit(incoming(5)).await;
        assert_eq!(service.stats().edits_processed, 0);

        // Untracked chat: ignored even with the toggle on.
        let mut store = MockStorePort::new();
        store.expect_update_message_text().never();
        let mut service = listener(
            base_config(),
            store,
            MockTgGateway::new(),
            MockNotifierPort::new(),
        );
        let mut foreign = incoming(5);
        foreign.chat_id = -555;
        service.handle_edit(foreign).await;
        assert_eq!(service.stats().edits_processed, 0);
    }

    #[tokio::test]
    async fn edit_updates_text_and_publishes() {
        let mut store = MockStorePort::new();
        store
            .expect_update_message_text()
            .withf(|chat_id, id, text, _| *chat_id == CHAT && *id == 5 && text == "message 5")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut notifier = MockNotifierPort::new();
        notifier
            .expect_publish()
            .withf(|e: &NotificationEvent| {
                matches!(e.kind, crate::domain::NotificationKind::Edit) && e.chat_id == CHAT
            })
            .times(1)
            .return_const(());

        let mut service = listener(base_config(), store, MockTgGateway::new(), notifier);
        service.handle_edit(incoming(5)).await;
        assert_eq!(service.stats().edits_processed, 1);
    }

    #[tokio::test]
    async fn new_message_tracks_and_persists() {
        let mut store = MockStorePort::new();
        store.expect_upsert_chat().times(1).returning(|_| Ok(()));
        store.expect_insert_message().times(1).returning(|_| Ok(()));
        store.expect_get_message_text().never();
        let mut gateway = MockTgGateway::new();
        gateway
            .expect_get_entity()
            .returning(|_| Err(DomainError::NotFound("gone".into())));
        let mut notifier = MockNotifierPort::new();
        notifier.expect_publish().times(1).return_const(());

        let mut service = listener(base_config(), store, gateway, notifier);
        service.handle_new_message(incoming(9)).await;
        assert_eq!(service.stats().new_messages_processed, 1);
    }

    #[tokio::test]
    async fn new_message_only_tracks_when_persistence_is_off() {
        let mut cfg = base_config();
        cfg.listen_new_messages = false;
        let mut store = MockStorePort::new();
        store.expect_insert_message().never();

        let mut service = listener(cfg, store, MockTgGateway::new(), MockNotifierPort::new());
        service.handle_new_message(incoming(9)).await;
        assert_eq!(service.stats().new_messages_processed, 0);
        assert!(service.tracked.contains(&CHAT));
    }

    #[tokio::test]
    async fn album_members_keep_real_types_and_group_id() {
        let mut store = MockStorePort::new();
        store.expect_upsert_chat().times(1).returning(|_| Ok(()));
        store
            .expect_insert_messages_batch()
            .withf(|records: &[crate::domain::MessageRecord]| {
                records.len() == 2
                    && records
                        .iter()
                        .all(|r| r.raw_data.grouped_id.as_deref() == Some("424242"))
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut gateway = MockTgGateway::new();
        gateway
            .expect_get_entity()
            .returning(|_| Err(DomainError::NotFound("gone".into())));
        let mut notifier = MockNotifierPort::new();
        notifier.expect_publish().times(2).return_const(());

        let mut service = listener(base_config(), store, gateway, notifier);
        let mut a = incoming(10);
        a.grouped_id = Some(424242);
        let mut b = incoming(11);
        b.grouped_id = Some(424242);
        service.handle_album(vec![a, b]).await;

        assert_eq!(service.stats().albums_processed, 1);
        assert_eq!(service.stats().new_messages_processed, 2);
    }

    #[tokio::test]
    async fn chat_action_refreshes_the_chat_row() {
        let mut store = MockStorePort::new();
        store
            .expect_upsert_chat()
            .withf(|c: &ChatRecord| c.id == CHAT && c.title.as_deref() == Some("Renamed"))
            .times(1)
            .returning(|_| Ok(()));
        let mut gateway = MockTgGateway::new();
        gateway.expect_get_entity().with(eq(CHAT)).returning(|_| {
            Ok(crate::domain::ChatInfo {
                id: CHAT,
                kind: ChatKind::Group,
                title: Some("Renamed".into()),
                username: None,
                first_name: None,
                last_name: None,
                phone: None,
                description: None,
                participants_count: None,
                photo_id: None,
                is_bot: false,
            })
        });
        let mut notifier = MockNotifierPort::new();
        notifier
            .expect_publish()
            .withf(|e: &NotificationEvent| {
                matches!(e.kind, crate::domain::NotificationKind::ChatUpdate)
            })
            .times(1)
            .return_const(());

        let mut service = listener(base_config(), store, gateway, notifier);
        service.handle_chat_action(CHAT).await;
        assert_eq!(service.stats().chat_updates_processed, 1);
    }
}
