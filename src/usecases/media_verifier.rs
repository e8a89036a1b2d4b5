//! Post-backup media sweep.
//!
//! Walks every media row that claims a file on disk and checks it against
//! the filesystem: missing, empty (interrupted transfer) or more than 1 %
//! off the recorded size means the row is flipped to not-downloaded and the
//! file is fetched again from the owning message. Messages gone upstream are
//! logged and given up on; the row stays not-downloaded.

use crate::adapters::media::{FileCheck, check_file};
use crate::domain::MediaRecord;
use crate::ports::{StorePort, TgGateway};
use crate::usecases::ingest::Ingestor;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct MediaVerifier {
    gateway: Arc<dyn TgGateway>,
    store: Arc<dyn StorePort>,
    ingestor: Arc<Ingestor>,
}

impl MediaVerifier {
    pub fn new(
        gateway: Arc<dyn TgGateway>,
        store: Arc<dyn StorePort>,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            gateway,
            store,
            ingestor,
        }
    }

    pub async fn run(&self) {
        info!("starting media verification");
        let records = match self.store.get_media_for_verification().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "could not list media for verification");
                return;
            }
        };
        info!(records = records.len(), "media records to verify");

        // Phase 1: classify against the filesystem.
        let mut broken: Vec<MediaRecord> = Vec::new();
        for record in records {
            let Some(path) = record.file_path.as_deref() else {
                continue;
            };
            match check_file(Path::new(path), record.file_size) {
                FileCheck::Ok => {}
                status => {
                    debug!(media_id = %record.id, ?status, "media file needs re-download");
                    broken.push(record);
                }
            }
        }
        if broken.is_empty() {
            info!("all media files verified, no issues found");
            return;
        }
        info!(broken = broken.len(), "re-downloading missing/corrupted media");

        // Phase 2: group by chat and re-fetch the owning messages in batches.
        let mut by_chat: HashMap<i64, Vec<MediaRecord>> = HashMap::new();
        for record in broken {
            by_chat.entry(record.chat_id).or_default().push(record);
        }

        let mut redownloaded = 0usize;
        let mut failed = 0usize;
        for (chat_id, records) in by_chat {
            let ids: Vec<i64> = records.iter().map(|r| r.message_id).collect();
            let messages = match self.gateway.get_messages_by_id(chat_id, &ids).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(chat_id, error = %e, "cannot access chat for media verification");
                    failed += records.len();
                    continue;
                }
            };
            let found: HashMap<i64, _> = ids
                .iter()
                .zip(messages)
                .filter_map(|(id, msg)| msg.map(|m| (*id, m)))
                .collect();

            for record in records {
                // Drop the bad bytes and flip the row before retrying.
                if let Some(path) = record.file_path.as_deref() {
                    let _ = tokio::fs::remove_file(path).await;
                }
                if let Err(e) = self.store.mark_media_for_redownload(&record.id).await {
                    warn!(media_id = %record.id, error = %e, "could not mark for re-download");
                }

                let Some(msg) = found.get(&record.message_id) else {
                    warn!(
                        chat_id,
                        message_id = record.message_id,
                        "message deleted upstream, media unrecoverable"
                    );
                    failed += 1;
                    continue;
                };
                if msg.media.is_none() {
                    warn!(
                        chat_id,
                        message_id = record.message_id,
                        "message no longer has media, unrecoverable"
                    );
                    failed += 1;
                    continue;
                }

                let refreshed = self.ingestor.process_message(msg, true).await;
                match refreshed {
                    Ok(rec) if rec.media_path.is_some() => {
                        redownloaded += 1;
                        debug!(media_id = %record.id, "media re-downloaded");
                    }
                    Ok(_) => failed += 1,
                    Err(e) => {
                        failed += 1;
                        error!(media_id = %record.id, error = %e, "re-download failed");
                    }
                }
            }
        }

        info!(redownloaded, failed, "media verification completed");
    }
}
