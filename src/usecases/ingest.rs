//! Shared message ingestion: turn an incoming message into persisted rows.
//!
//! Both the backup engine and the live listener run messages through this
//! path so the record shape stays identical: sender upsert, reply preview,
//! forward name resolution, poll capture, media download with size guard
//! and dedup, string `grouped_id`.

use crate::adapters::media::{MediaPlacement, MediaStore, media_id, media_file_name};
use crate::domain::{
    DomainError, IncomingMedia, IncomingMessage, MediaKind, MediaRecord, MessageRecord, RawData,
    ReactionRow, expand_reactions,
};
use crate::ports::{StorePort, TgGateway};
use crate::shared::time::{now_utc_naive, to_utc_naive, to_utc_naive_opt};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Ingestor {
    store: Arc<dyn StorePort>,
    gateway: Arc<dyn TgGateway>,
    media: MediaStore,
    max_media_bytes: u64,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn StorePort>,
        gateway: Arc<dyn TgGateway>,
        media: MediaStore,
        max_media_bytes: u64,
    ) -> Self {
        Self {
            store,
            gateway,
            media,
            max_media_bytes,
        }
    }

    pub fn media_store(&self) -> &MediaStore {
        &self.media
    }

    /// Build the persistable record for one message, upserting its sender
    /// and downloading media when `download_media` is on.
    pub async fn process_message(
        &self,
        msg: &IncomingMessage,
        download_media: bool,
    ) -> Result<MessageRecord, DomainError> {
        if let Some(sender) = &msg.sender {
            self.store.upsert_user(sender).await?;
        }

        let mut raw_data = RawData::default();
        if let Some(grouped_id) = msg.grouped_id {
            raw_data.grouped_id = Some(grouped_id.to_string());
        }
        if let Some(post_author) = &msg.post_author {
            raw_data.post_author = Some(post_author.clone());
        }
        if let Some(forward) = &msg.forward {
            raw_data.forward_from_name = match &forward.from_name {
                Some(name) => Some(name.clone()),
                // Hidden forwards carry a plain name; otherwise resolve the
                // source entity, falling back to the bare id in the viewer.
                None => match forward.from_id {
                    Some(from_id) => match self.gateway.get_entity(from_id).await {
                        Ok(entity) => Some(entity.display_name()),
                        Err(e) => {
                            debug!(from_id, error = %e, "forward source not resolvable");
                            None
                        }
                    },
                    None => None,
                },
            };
        }

        let reply_to_text = match msg.reply_to_msg_id {
            Some(reply_id) => self
                .store
                .get_message_text(msg.chat_id, reply_id)
                .await?
                .map(|text| text.chars().take(100).collect()),
            None => None,
        };

        let mut record = MessageRecord {
            id: msg.id,
            chat_id: msg.chat_id,
            sender_id: msg.sender_id,
            date: to_utc_naive(msg.date),
            text: msg.text.clone(),
            reply_to_msg_id: msg.reply_to_msg_id,
            reply_to_text,
            forward_from_id: msg.forward.as_ref().and_then(|f| f.from_id),
            edit_date: to_utc_naive_opt(msg.edit_date),
            media_type: None,
            media_id: None,
            media_path: None,
            raw_data,
            is_outgoing: msg.outgoing,
        };

        if let Some(poll) = &msg.poll {
            // Polls are never downloaded; the structure goes into raw_data.
            record.media_type = Some(MediaKind::Poll);
            record.raw_data.poll = Some(poll.clone());
        } else if let Some(media) = &msg.media {
            if download_media {
                let (kind, id, path) = self.process_media(msg, media).await;
                record.media_type = Some(kind);
                record.media_id = Some(id);
                record.media_path = path;
            } else {
                record.media_type = Some(media.kind);
            }
        }

        Ok(record)
    }

    /// Stored reaction rows for a message (per-user rows plus anonymous
    /// remainder); empty input clears nothing and is skipped by callers.
    pub fn reaction_rows(msg: &IncomingMessage) -> Vec<ReactionRow> {
        expand_reactions(&msg.reactions)
    }

    /// Download (or account for) one media file and upsert its row. Errors
    /// degrade to a `downloaded=0` row; the message itself always persists.
    async fn process_media(
        &self,
        msg: &IncomingMessage,
        media: &IncomingMedia,
    ) -> (MediaKind, String, Option<String>) {
        let id = media_id(msg.chat_id, msg.id, media.kind);
        let mut record = MediaRecord {
            id: id.clone(),
            message_id: msg.id,
            chat_id: msg.chat_id,
            kind: media.kind,
            file_path: None,
            file_name: None,
            file_size: (media.size > 0).then_some(media.size),
            mime_type: media.mime_type.clone(),
            width: media.width,
            height: media.height,
            duration: media.duration,
            downloaded: false,
            download_date: None,
        };

        let transferable = !matches!(media.kind, MediaKind::Contact | MediaKind::Geo);
        if transferable && media.size as u64 > self.max_media_bytes {
            debug!(
                chat_id = msg.chat_id,
                msg_id = msg.id,
                size = media.size,
                "media exceeds size limit, recording without download"
            );
            self.insert_media_row(&record).await;
            return (media.kind, id, None);
        }

        if !transferable {
            self.insert_media_row(&record).await;
            return (media.kind, id, None);
        }

        let file_name = media_file_name(
            media.file_id,
            media.original_name.as_deref(),
            media.mime_type.as_deref(),
            media.kind,
        );
        record.file_name = Some(file_name.clone());

        match self.fetch_media_file(msg, &file_name).await {
            Ok((path, size)) => {
                record.file_path = Some(path.to_string_lossy().into_owned());
                record.file_size = Some(size as i64);
                record.downloaded = true;
                record.download_date = Some(now_utc_naive());
            }
            Err(e) => {
                error!(
                    chat_id = msg.chat_id,
                    msg_id = msg.id,
                    error = %e,
                    "media download failed"
                );
            }
        }
        let path = record.file_path.clone();
        self.insert_media_row(&record).await;
        (media.kind, id, path)
    }

    async fn fetch_media_file(
        &self,
        msg: &IncomingMessage,
        file_name: &str,
    ) -> Result<(std::path::PathBuf, u64), DomainError> {
        let placement = self
            .media
            .plan(msg.chat_id, file_name)
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?;
        if let MediaPlacement::NeedsDownload { download_to, .. } = &placement {
            self.gateway
                .download_media(msg.chat_id, msg.id, download_to)
                .await?;
        }
        self.media
            .finalize(&placement)
            .await
            .map_err(|e| DomainError::Media(e.to_string()))
    }

    async fn insert_media_row(&self, record: &MediaRecord) {
        if let Err(e) = self.store.insert_media(record).await {
            warn!(media_id = %record.id, error = %e, "media row insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatInfo, ChatKind, ForwardInfo, ReactionSummary, UserRecord};
    use crate::ports::{MockStorePort, MockTgGateway};
    use chrono::{TimeZone, Utc};
    use mockall::predicate::eq;

    fn incoming(id: i64, chat_id: i64) -> IncomingMessage {
        IncomingMessage {
            id,
            chat_id,
            date: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
            text: "hello".into(),
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

    fn ingestor(store: MockStorePort, gateway: MockTgGateway) -> Ingestor {
        let dir = tempfile::tempdir().unwrap();
        Ingestor::new(
            Arc::new(store),
            Arc::new(gateway),
            MediaStore::new(dir.path(), true),
            100 * 1024 * 1024,
        )
    }

    #[tokio::test]
    async fn grouped_id_lands_as_string() {
        let mut store = MockStorePort::new();
        store.expect_get_message_text().never();
        let gateway = MockTgGateway::new();
        let mut msg = incoming(5, -42);
        msg.grouped_id = Some(13579246801234);

        let record = ingestor(store, gateway)
            .process_message(&msg, false)
            .await
            .unwrap();
        assert_eq!(record.raw_data.grouped_id.as_deref(), Some("13579246801234"));
        assert!(!record.is_outgoing);
    }

    #[tokio::test]
    async fn sender_is_upserted_and_reply_preview_filled() {
        let mut store = MockStorePort::new();
        store
            .expect_upsert_user()
            .withf(|u: &UserRecord| u.id == 1001)
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_get_message_text()
            .with(eq(-42), eq(3))
            .times(1)
            .returning(|_, _| Ok(Some("x".repeat(300))));
        let gateway = MockTgGateway::new();

        let mut msg = incoming(5, -42);
        msg.sender = Some(UserRecord {
            id: 1001,
            username: Some("alice".into()),
            first_name: Some("Alice".into()),
            last_name: None,
            phone: None,
            is_bot: false,
        });
        msg.reply_to_msg_id = Some(3);

        let record = ingestor(store, gateway)
            .process_message(&msg, false)
            .await
            .unwrap();
        assert_eq!(record.reply_to_text.unwrap().chars().count(), 100);
    }

    #[tokio::test]
    async fn forward_name_resolves_through_gateway() {
        let store = MockStorePort::new();
        let mut gateway = MockTgGateway::new();
        gateway
            .expect_get_entity()
            .with(eq(-100555))
            .times(1)
            .returning(|_| {
                Ok(ChatInfo {
                    id: -100555,
                    kind: ChatKind::Channel,
                    title: Some("News".into()),
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

        let mut msg = incoming(5, -42);
        msg.forward = Some(ForwardInfo {
            from_id: Some(-100555),
            from_name: None,
        });

        let record = ingestor(store, gateway)
            .process_message(&msg, false)
            .await
            .unwrap();
        assert_eq!(record.forward_from_id, Some(-100555));
        assert_eq!(record.raw_data.forward_from_name.as_deref(), Some("News"));
    }

    #[tokio::test]
    async fn polls_are_captured_never_downloaded() {
        let store = MockStorePort::new();
        let mut gateway = MockTgGateway::new();
        gateway.expect_download_media().never();

        let mut msg = incoming(5, -42);
        msg.poll = Some(crate::domain::PollData {
            id: Some(77),
            question: "Lunch?".into(),
            answers: vec![],
            closed: false,
            public_voters: false,
            multiple_choice: false,
            quiz: false,
            results: None,
        });

        let record = ingestor(store, gateway)
            .process_message(&msg, true)
            .await
            .unwrap();
        assert_eq!(record.media_type, Some(MediaKind::Poll));
        assert!(record.media_id.is_none());
        assert_eq!(record.raw_data.poll.as_ref().unwrap().question, "Lunch?");
    }

    #[tokio::test]
    async fn oversized_media_records_row_without_transfer() {
        let mut store = MockStorePort::new();
        store
            .expect_insert_media()
            .withf(|m: &MediaRecord| !m.downloaded && m.file_size == Some(500_000_000))
            .times(1)
            .returning(|_| Ok(()));
        let mut gateway = MockTgGateway::new();
        gateway.expect_download_media().never();

        let mut msg = incoming(5, -42);
        msg.media = Some(IncomingMedia {
            file_id: 99,
            kind: MediaKind::Video,
            size: 500_000_000,
            mime_type: Some("video/mp4".into()),
            original_name: None,
            width: None,
            height: None,
            duration: Some(60),
        });

        let record = ingestor(store, gateway)
            .process_message(&msg, true)
            .await
            .unwrap();
        assert_eq!(record.media_type, Some(MediaKind::Video));
        assert_eq!(record.media_id.as_deref(), Some("-42_5_video"));
        assert!(record.media_path.is_none());
    }

    #[tokio::test]
    async fn failed_download_degrades_to_undownloaded_row() {
        let mut store = MockStorePort::new();
        store
            .expect_insert_media()
            .withf(|m: &MediaRecord| !m.downloaded && m.file_name.is_some())
            .times(1)
            .returning(|_| Ok(()));
        let mut gateway = MockTgGateway::new();
        gateway
            .expect_download_media()
            .times(1)
            .returning(|_, _, _| Err(DomainError::Media("file reference expired".into())));

        let mut msg = incoming(5, -42);
        msg.media = Some(IncomingMedia {
            file_id: 99,
            kind: MediaKind::Photo,
            size: 1000,
            mime_type: Some("image/jpeg".into()),
            original_name: None,
            width: Some(10),
            height: Some(10),
            duration: None,
        });

        let record = ingestor(store, gateway)
            .process_message(&msg, true)
            .await
            .unwrap();
        assert!(record.media_path.is_none());
        assert_eq!(record.media_id.as_deref(), Some("-42_5_photo"));
    }

    #[test]
    fn reaction_rows_expand() {
        let mut msg = incoming(5, -42);
        msg.reactions = vec![ReactionSummary {
            emoji: "👍".into(),
            count: 3,
            user_ids: vec![1],
        }];
        let rows = Ingestor::reaction_rows(&msg);
        assert_eq!(rows.len(), 2);
    }
}
