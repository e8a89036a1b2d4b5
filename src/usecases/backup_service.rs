//! Backup engine: one run mirrors every admitted dialog incrementally.
//!
//! Pipeline per run: authenticate and persist the owner id, snapshot the run
//! start time, enumerate dialogs, apply the admission ruleset, fetch missing
//! includes, delete excluded chats, order (priority first, then recency),
//! then pull each dialog from its cursor in batches. Cursor advance happens
//! only after the corresponding batch is durable. Per-chat failures are
//! logged and never halt the outer loop.

use crate::adapters::persistence::keys;
use crate::domain::{ChatInfo, DialogInfo, DomainError};
use crate::ports::{StorePort, TgGateway};
use crate::shared::AppConfig;
use crate::shared::time::to_utc_naive_opt;
use crate::usecases::ingest::Ingestor;
use crate::usecases::media_verifier::MediaVerifier;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reconciliation fetch size for the deletion/edit sweep.
const SYNC_CHECK_BATCH: usize = 100;

#[derive(Debug, Default)]
pub struct BackupRunStats {
    pub dialogs: usize,
    pub new_messages: usize,
    pub deleted_chats: usize,
}

pub struct BackupService {
    gateway: Arc<dyn TgGateway>,
    store: Arc<dyn StorePort>,
    ingestor: Arc<Ingestor>,
    cfg: Arc<AppConfig>,
}

impl BackupService {
    pub fn new(
        gateway: Arc<dyn TgGateway>,
        store: Arc<dyn StorePort>,
        ingestor: Arc<Ingestor>,
        cfg: Arc<AppConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            ingestor,
            cfg,
        }
    }

    /// Run one full backup pass. This is the scheduler's entry point.
    pub async fn run_backup(&self) -> Result<BackupRunStats, DomainError> {
        let started = std::time::Instant::now();
        info!("starting backup run");

        let me = self.gateway.me().await?;
        self.store
            .set_metadata(keys::OWNER_ID, &me.id.to_string())
            .await?;
        self.store.backfill_outgoing(me.id).await?;

        // Snapshot the start time now so viewers see monotonic progress even
        // while the run is still going.
        let run_started = format!("{}Z", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"));
        self.store
            .set_metadata(keys::LAST_BACKUP_TIME, &run_started)
            .await?;

        let dialogs = self.gateway.get_dialogs().await?;
        info!(total = dialogs.len(), "dialog list fetched");

        let (mut admitted, excluded, seen) = self.filter_dialogs(&dialogs);
        self.fetch_missing_includes(&mut admitted, &seen, &excluded)
            .await;

        let mut stats = BackupRunStats::default();
        for chat_id in &excluded {
            match self
                .store
                .delete_chat_and_related_data(*chat_id, Some(&self.cfg.media_path()))
                .await
            {
                Ok(()) => stats.deleted_chats += 1,
                Err(e) => error!(chat_id, error = %e, "failed to delete excluded chat"),
            }
        }

        self.order_dialogs(&mut admitted);
        info!(admitted = admitted.len(), excluded = excluded.len(), "dialog filtering done");

        for (index, dialog) in admitted.iter().enumerate() {
            let chat_id = dialog.chat.id;
            let name = dialog.chat.display_name();
            info!(
                chat_id,
                progress = format!("{}/{}", index + 1, admitted.len()),
                "backing up: {name}"
            );
            match self.backup_dialog(&dialog.chat).await {
                Ok(count) => {
                    stats.new_messages += count;
                    stats.dialogs += 1;
                    if count > 0 {
                        info!(chat_id, count, "new messages backed up");
                    }
                }
                Err(DomainError::FloodWait { seconds }) => {
                    warn!(chat_id, seconds, "rate limited upstream, skipping chat this run");
                }
                Err(e) => error!(chat_id, error = %e, "dialog backup failed"),
            }
        }

        let totals = self.store.compute_statistics().await?;
        self.cache_statistics(&totals).await;
        info!(
            duration_secs = started.elapsed().as_secs(),
            new_messages = stats.new_messages,
            chats = totals.chats,
            messages = totals.messages,
            media_files = totals.media_files,
            total_size_mb = totals.total_size_mb,
            "backup run completed"
        );

        if self.cfg.verify_media {
            MediaVerifier::new(
                Arc::clone(&self.gateway),
                Arc::clone(&self.store),
                Arc::clone(&self.ingestor),
            )
            .run()
            .await;
        }

        Ok(stats)
    }

    /// Apply the admission ruleset. Returns (admitted, marked-for-deletion,
    /// every id seen in the enumeration).
    fn filter_dialogs(
        &self,
        dialogs: &[DialogInfo],
    ) -> (Vec<DialogInfo>, HashSet<i64>, HashSet<i64>) {
        let mut admitted = Vec::new();
        let mut excluded = HashSet::new();
        let mut seen = HashSet::new();
        for dialog in dialogs {
            let chat = &dialog.chat;
            seen.insert(chat.id);
            let (is_user, is_group, is_channel) = chat_flags(chat);
            if self
                .cfg
                .is_explicitly_excluded(chat.id, is_user, is_group, is_channel)
            {
                excluded.insert(chat.id);
            } else if self
                .cfg
                .should_backup_chat(chat.id, is_user, is_group, is_channel)
            {
                admitted.push(dialog.clone());
            }
        }
        (admitted, excluded, seen)
    }

    /// Include-listed chats that never showed up in the dialog list are
    /// fetched explicitly (archived or not recently messaged); failures are
    /// warnings.
    async fn fetch_missing_includes(
        &self,
        admitted: &mut Vec<DialogInfo>,
        seen: &HashSet<i64>,
        excluded: &HashSet<i64>,
    ) {
        let missing: Vec<i64> = self
            .cfg
            .all_include_ids()
            .into_iter()
            .filter(|id| !seen.contains(id) && !excluded.contains(id))
            .collect();
        if missing.is_empty() {
            return;
        }
        info!(count = missing.len(), "fetching explicitly included chats not in dialogs");
        for include_id in missing {
            match self.gateway.get_entity(include_id).await {
                Ok(chat) => {
                    info!(chat_id = include_id, "added explicitly included chat: {}", chat.display_name());
                    admitted.push(DialogInfo {
                        chat,
                        last_activity: Some(Utc::now().timestamp()),
                    });
                }
                Err(e) => {
                    warn!(chat_id = include_id, error = %e, "could not fetch included chat");
                }
            }
        }
    }

    /// Priority ids first (in configured order), then most recently active.
    /// Epoch-second comparison sidesteps tz-aware/naive ordering bugs.
    fn order_dialogs(&self, dialogs: &mut [DialogInfo]) {
        let priority = &self.cfg.priority_chat_ids;
        dialogs.sort_by_key(|d| {
            let rank = priority
                .iter()
                .position(|id| *id == d.chat.id)
                .unwrap_or(usize::MAX);
            (rank, -(d.last_activity.unwrap_or(0)))
        });
        let priority_count = dialogs
            .iter()
            .filter(|d| priority.contains(&d.chat.id))
            .count();
        if priority_count > 0 {
            info!(priority_count, "priority chats will be processed first");
        }
    }

    /// Incremental pull for one dialog. Returns the number of new messages.
    async fn backup_dialog(&self, chat: &ChatInfo) -> Result<usize, DomainError> {
        let chat_id = chat.id;
        self.store.upsert_chat(&chat.to_record()).await?;
        self.ensure_avatar(chat).await;

        let mut cursor = self.store.get_last_message_id(chat_id).await?;
        let mut total = 0usize;

        loop {
            let batch = self
                .gateway
                .fetch_messages_after(chat_id, cursor, self.cfg.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut records = Vec::with_capacity(batch.len());
            let mut reactions = Vec::new();
            for msg in &batch {
                let record = self
                    .ingestor
                    .process_message(msg, self.cfg.download_media)
                    .await?;
                let rows = Ingestor::reaction_rows(msg);
                if !rows.is_empty() {
                    reactions.push((record.id, rows));
                }
                records.push(record);
            }

            self.store.insert_messages_batch(&records).await?;
            for (message_id, rows) in reactions {
                self.store
                    .insert_reactions(message_id, chat_id, &rows)
                    .await?;
            }

            let batch_max = batch.iter().map(|m| m.id).max().unwrap_or(cursor);
            // The batch is durable; only now may the cursor advance.
            self.store
                .update_sync_status(chat_id, batch_max, records.len() as i64)
                .await?;
            cursor = batch_max;
            total += records.len();
            info!(chat_id, processed = total, checkpoint = cursor, "batch saved");
        }

        if self.cfg.sync_deletions_edits {
            self.sync_deletions_and_edits(chat_id).await?;
        }

        Ok(total)
    }

    /// Make sure the current profile photo exists on disk. Older photos are
    /// kept; only a missing or empty current file triggers a download.
    async fn ensure_avatar(&self, chat: &ChatInfo) {
        let Some(photo_id) = chat.photo_id else {
            return;
        };
        let path = self
            .ingestor
            .media_store()
            .avatar_path(chat.kind, chat.id, photo_id);
        let needs_download = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if !needs_download {
            return;
        }
        if let Err(e) = self.gateway.download_profile_photo(chat.id, &path).await {
            warn!(chat_id = chat.id, error = %e, "avatar download failed");
        }
    }

    /// Full reconciliation against upstream: a null response means the
    /// message is gone, a differing edit date means the text changed.
    async fn sync_deletions_and_edits(&self, chat_id: i64) -> Result<(), DomainError> {
        let local = self.store.get_messages_sync_data(chat_id).await?;
        if local.is_empty() {
            return Ok(());
        }
        info!(chat_id, messages = local.len(), "syncing deletions and edits");

        let ids: Vec<i64> = local.keys().copied().collect();
        let mut deleted = 0usize;
        let mut updated = 0usize;
        for chunk in ids.chunks(SYNC_CHECK_BATCH) {
            let remote = match self.gateway.get_messages_by_id(chat_id, chunk).await {
                Ok(remote) => remote,
                Err(e) => {
                    error!(chat_id, error = %e, "reconciliation batch failed");
                    continue;
                }
            };
            for (msg_id, upstream) in chunk.iter().zip(remote) {
                match upstream {
                    None => {
                        self.store.delete_message(chat_id, *msg_id).await?;
                        deleted += 1;
                    }
                    Some(msg) => {
                        let remote_edit = to_utc_naive_opt(msg.edit_date);
                        let local_edit = local.get(msg_id).copied().flatten();
                        if remote_edit.is_some() && remote_edit != local_edit {
                            self.store
                                .update_message_text(chat_id, *msg_id, &msg.text, remote_edit)
                                .await?;
                            updated += 1;
                        }
                    }
                }
            }
        }
        if deleted > 0 || updated > 0 {
            info!(chat_id, deleted, updated, "reconciliation applied");
        }
        Ok(())
    }

    async fn cache_statistics(&self, stats: &crate::domain::Statistics) {
        if let Ok(json) = serde_json::to_string(stats) {
            let _ = self.store.set_metadata(keys::STATS_CACHE, &json).await;
            let _ = self
                .store
                .set_metadata(
                    keys::STATS_CALCULATED_AT,
                    &format!("{}Z", Utc::now().format("%Y-%m-%dT%H:%M:%S")),
                )
                .await;
        }
    }
}

fn chat_flags(chat: &ChatInfo) -> (bool, bool, bool) {
    match chat.kind {
        crate::domain::ChatKind::Private => (!chat.is_bot, false, false),
        crate::domain::ChatKind::Group => (false, true, false),
        crate::domain::ChatKind::Channel => (false, false, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::media::MediaStore;
    use crate::domain::ChatKind;
    use crate::ports::{MockStorePort, MockTgGateway};
    use crate::shared::config::tests_support::base_config;

    fn dialog(id: i64, kind: ChatKind, activity: i64) -> DialogInfo {
        DialogInfo {
            chat: ChatInfo {
                id,
                kind,
                title: Some(format!("chat {id}")),
                username: None,
                first_name: None,
                last_name: None,
                phone: None,
                description: None,
                participants_count: None,
                photo_id: None,
                is_bot: false,
            },
            last_activity: Some(activity),
        }
    }

    fn service(cfg: AppConfig) -> BackupService {
        let store: Arc<dyn StorePort> = Arc::new(MockStorePort::new());
        let gateway: Arc<dyn TgGateway> = Arc::new(MockTgGateway::new());
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            MediaStore::new(dir.path(), true),
            100 * 1024 * 1024,
        ));
        BackupService::new(gateway, store, ingestor, Arc::new(cfg))
    }

    #[test]
    fn excluded_chats_are_marked_for_deletion_not_admitted() {
        let mut cfg = base_config();
        cfg.groups_exclude_ids.insert(-42);
        let svc = service(cfg);

        let dialogs = vec![
            dialog(1001, ChatKind::Private, 10),
            dialog(-42, ChatKind::Group, 20),
            dialog(-100123456789, ChatKind::Channel, 30),
        ];
        let (admitted, excluded, seen) = svc.filter_dialogs(&dialogs);
        assert_eq!(admitted.len(), 2);
        assert!(excluded.contains(&-42));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn type_filter_drops_unlisted_kinds() {
        let mut cfg = base_config();
        cfg.chat_types = vec![crate::shared::config::ChatTypeFilter::Private];
        let svc = service(cfg);

        let dialogs = vec![
            dialog(1001, ChatKind::Private, 10),
            dialog(-100123456789, ChatKind::Channel, 30),
        ];
        let (admitted, excluded, _) = svc.filter_dialogs(&dialogs);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].chat.id, 1001);
        assert!(excluded.is_empty());
    }

    #[test]
    fn bots_are_not_private_chats_for_admission() {
        let cfg = base_config();
        let svc = service(cfg);
        let mut bot = dialog(2002, ChatKind::Private, 10);
        bot.chat.is_bot = true;
        let (admitted, _, _) = svc.filter_dialogs(&[bot]);
        assert!(admitted.is_empty());
    }

    #[test]
    fn ordering_puts_priority_first_then_recency() {
        let mut cfg = base_config();
        cfg.priority_chat_ids = vec![-7, 1001];
        let svc = service(cfg);

        let mut dialogs = vec![
            dialog(-100, ChatKind::Group, 50),
            dialog(1001, ChatKind::Private, 10),
            dialog(-200, ChatKind::Group, 90),
            dialog(-7, ChatKind::Group, 1),
        ];
        svc.order_dialogs(&mut dialogs);
        let ids: Vec<i64> = dialogs.iter().map(|d| d.chat.id).collect();
        assert_eq!(ids, vec![-7, 1001, -200, -100]);
    }
}
