//! Client/server store via tokio-postgres behind a deadpool pool.
//!
//! Same semantics as the embedded store; this dialect gets native timestamps,
//! `ILIKE` search and real concurrent writers. The pool keeps a handful of
//! connections; LISTEN/NOTIFY uses its own dedicated connection elsewhere.

use crate::adapters::media::remove_chat_files;
use crate::adapters::persistence::retry::{map_store_err, with_retry};
use crate::adapters::persistence::schema::POSTGRES_SCHEMA;
use crate::adapters::persistence::{group_reactions, keys, reply_prefix};
use crate::domain::{
    ChatKind, ChatOverview, ChatPage, ChatRecord, ChatStats, DomainError, ExportRow, ExportSender,
    MediaKind, MediaRecord, MessageQuery, MessageRecord, MessageView, PushSubscriptionRecord,
    Statistics, UserRecord,
};
use crate::ports::{StoreFlavor, StorePort};
use crate::shared::time::now_utc_naive;
use chrono::NaiveDateTime;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

const POOL_SIZE: usize = 5;

const MESSAGE_UPSERT: &str = r#"
    INSERT INTO messages (
        id, chat_id, sender_id, date, text, reply_to_msg_id, reply_to_text,
        forward_from_id, edit_date, media_type, media_id, media_path,
        raw_data, created_at, is_outgoing
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
    ON CONFLICT (id, chat_id) DO UPDATE SET
        sender_id = excluded.sender_id,
        date = excluded.date,
        text = excluded.text,
        reply_to_msg_id = excluded.reply_to_msg_id,
        reply_to_text = excluded.reply_to_text,
        forward_from_id = excluded.forward_from_id,
        edit_date = excluded.edit_date,
        media_type = excluded.media_type,
        media_id = excluded.media_id,
        media_path = excluded.media_path,
        raw_data = excluded.raw_data,
        is_outgoing = excluded.is_outgoing
"#;

const MESSAGE_VIEW_SELECT: &str = r#"
    SELECT m.id, m.chat_id, m.sender_id, m.date, m.text, m.reply_to_msg_id,
           m.reply_to_text, m.forward_from_id, m.edit_date, m.media_type,
           m.media_id, m.media_path, m.raw_data, m.is_outgoing,
           u.first_name, u.last_name, u.username,
           md.file_name, md.mime_type
    FROM messages m
    LEFT JOIN users u ON m.sender_id = u.id
    LEFT JOIN media md ON md.id = m.media_id
"#;

/// Client/server Postgres store.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the pool and ensure the schema exists.
    pub async fn connect(conn_string: &str) -> Result<Self, DomainError> {
        let pg_config =
            tokio_postgres::Config::from_str(conn_string).map_err(map_store_err)?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(map_store_err)?;

        let client = pool.get().await.map_err(map_store_err)?;
        for stmt in POSTGRES_SCHEMA {
            client.execute(*stmt, &[]).await.map_err(map_store_err)?;
        }
        info!("client/server store ready");
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, DomainError> {
        self.pool.get().await.map_err(map_store_err)
    }

    fn chat_from_row(row: &Row) -> Result<ChatRecord, DomainError> {
        Ok(ChatRecord {
            id: row.try_get(0).map_err(map_store_err)?,
            kind: ChatKind::from_str(row.try_get::<_, &str>(1).map_err(map_store_err)?),
            title: row.try_get(2).unwrap_or(None),
            username: row.try_get(3).unwrap_or(None),
            first_name: row.try_get(4).unwrap_or(None),
            last_name: row.try_get(5).unwrap_or(None),
            phone: row.try_get(6).unwrap_or(None),
            description: row.try_get(7).unwrap_or(None),
            participants_count: row.try_get(8).unwrap_or(None),
            last_synced_message_id: row.try_get(9).unwrap_or(0),
            created_at: row.try_get(10).unwrap_or(None),
            updated_at: row.try_get(11).unwrap_or(None),
        })
    }

    fn view_from_row(row: &Row) -> Result<MessageView, DomainError> {
        let raw: Option<String> = row.try_get(12).unwrap_or(None);
        Ok(MessageView {
            id: row.try_get(0).map_err(map_store_err)?,
            chat_id: row.try_get(1).map_err(map_store_err)?,
            sender_id: row.try_get(2).unwrap_or(None),
            date: row.try_get(3).map_err(map_store_err)?,
            text: row.try_get(4).unwrap_or(None),
            reply_to_msg_id: row.try_get(5).unwrap_or(None),
            reply_to_text: row.try_get(6).unwrap_or(None),
            forward_from_id: row.try_get(7).unwrap_or(None),
            edit_date: row.try_get(8).unwrap_or(None),
            media_type: row.try_get(9).unwrap_or(None),
            media_id: row.try_get(10).unwrap_or(None),
            media_path: row.try_get(11).unwrap_or(None),
            raw_data: raw
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            is_outgoing: row.try_get::<_, i32>(13).unwrap_or(0) as i64,
            first_name: row.try_get(14).unwrap_or(None),
            last_name: row.try_get(15).unwrap_or(None),
            username: row.try_get(16).unwrap_or(None),
            media_file_name: row.try_get(17).unwrap_or(None),
            media_mime_type: row.try_get(18).unwrap_or(None),
            reactions: Vec::new(),
        })
    }

    fn media_from_row(row: &Row) -> Result<MediaRecord, DomainError> {
        Ok(MediaRecord {
            id: row.try_get(0).map_err(map_store_err)?,
            message_id: row.try_get::<_, Option<i64>>(1).unwrap_or(None).unwrap_or(0),
            chat_id: row.try_get::<_, Option<i64>>(2).unwrap_or(None).unwrap_or(0),
            kind: row
                .try_get::<_, Option<&str>>(3)
                .unwrap_or(None)
                .and_then(MediaKind::from_str)
                .unwrap_or(MediaKind::Document),
            file_path: row.try_get(4).unwrap_or(None),
            file_name: row.try_get(5).unwrap_or(None),
            file_size: row.try_get(6).unwrap_or(None),
            mime_type: row.try_get(7).unwrap_or(None),
            width: row.try_get(8).unwrap_or(None),
            height: row.try_get(9).unwrap_or(None),
            duration: row.try_get(10).unwrap_or(None),
            downloaded: row.try_get::<_, i32>(11).unwrap_or(0) != 0,
            download_date: row.try_get(12).unwrap_or(None),
        })
    }

    async fn enrich_view(&self, view: &mut MessageView) -> Result<(), DomainError> {
        if view.reply_to_text.is_none() {
            if let Some(reply_id) = view.reply_to_msg_id {
                if let Some(text) = self.get_message_text(view.chat_id, reply_id).await? {
                    view.reply_to_text = Some(reply_prefix(&text));
                }
            }
        }
        let rows = self.get_reactions(view.id, view.chat_id).await?;
        view.reactions = group_reactions(rows);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorePort for PostgresStore {
    fn flavor(&self) -> StoreFlavor {
        StoreFlavor::Postgres
    }

    async fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), DomainError> {
        with_retry("upsert_chat", || async {
            let client = self.client().await?;
            let now = now_utc_naive();
            client
                .execute(
                    r#"
                    INSERT INTO chats (id, type, title, username, first_name, last_name,
                                       phone, description, participants_count, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
                    ON CONFLICT (id) DO UPDATE SET
                        type = excluded.type,
                        title = excluded.title,
                        username = excluded.username,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        phone = excluded.phone,
                        description = excluded.description,
                        participants_count = excluded.participants_count,
                        updated_at = excluded.updated_at
                    "#,
                    &[
                        &chat.id,
                        &chat.kind.as_str(),
                        &chat.title,
                        &chat.username,
                        &chat.first_name,
                        &chat.last_name,
                        &chat.phone,
                        &chat.description,
                        &chat.participants_count,
                        &now,
                    ],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_chat(&self, chat_id: i64) -> Result<Option<ChatRecord>, DomainError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                r#"
                SELECT id, type, title, username, first_name, last_name, phone,
                       description, participants_count, last_synced_message_id,
                       created_at, updated_at
                FROM chats WHERE id = $1
                "#,
                &[&chat_id],
            )
            .await
            .map_err(map_store_err)?;
        row.map(|r| Self::chat_from_row(&r)).transpose()
    }

    async fn get_all_chats(
        &self,
        limit: Option<u32>,
        offset: u32,
        search: Option<&str>,
    ) -> Result<ChatPage, DomainError> {
        let client = self.client().await?;
        let base = r#"
            FROM chats c
            LEFT JOIN (
                SELECT chat_id, MAX(date) AS last_message_date
                FROM messages GROUP BY chat_id
            ) lm ON lm.chat_id = c.id
        "#;
        let filter = r#"
            WHERE (COALESCE(c.title, '') || ' ' || COALESCE(c.username, '') || ' '
                  || COALESCE(c.first_name, '') || ' ' || COALESCE(c.last_name, '')) ILIKE $1
        "#;
        let select = r#"
            SELECT c.id, c.type, c.title, c.username, c.first_name, c.last_name,
                   c.phone, c.description, c.participants_count,
                   c.last_synced_message_id, c.created_at, c.updated_at,
                   lm.last_message_date
        "#;
        let order = " ORDER BY lm.last_message_date DESC NULLS LAST";
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let offset = offset as i64;

        let (total, rows) = match search {
            Some(needle) => {
                let pattern = format!("%{needle}%");
                let total: i64 = client
                    .query_one(&format!("SELECT COUNT(*) {base} {filter}"), &[&pattern])
                    .await
                    .map_err(map_store_err)?
                    .get(0);
                let rows = client
                    .query(
                        &format!("{select} {base} {filter} {order} LIMIT $2 OFFSET $3"),
                        &[&pattern, &limit, &offset],
                    )
                    .await
                    .map_err(map_store_err)?;
                (total, rows)
            }
            None => {
                let total: i64 = client
                    .query_one("SELECT COUNT(*) FROM chats", &[])
                    .await
                    .map_err(map_store_err)?
                    .get(0);
                let rows = client
                    .query(
                        &format!("{select} {base} {order} LIMIT $1 OFFSET $2"),
                        &[&limit, &offset],
                    )
                    .await
                    .map_err(map_store_err)?;
                (total, rows)
            }
        };

        let mut chats = Vec::with_capacity(rows.len());
        for row in rows {
            chats.push(ChatOverview {
                chat: Self::chat_from_row(&row)?,
                last_message_date: row.try_get(12).unwrap_or(None),
                avatar_url: None,
            });
        }
        Ok(ChatPage {
            chats,
            total: total as u64,
        })
    }

    async fn get_all_chat_ids(&self) -> Result<Vec<i64>, DomainError> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT id FROM chats", &[])
            .await
            .map_err(map_store_err)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn delete_chat_and_related_data(
        &self,
        chat_id: i64,
        media_root: Option<&Path>,
    ) -> Result<(), DomainError> {
        with_retry("delete_chat_and_related_data", || async {
            let mut client = self.client().await?;
            let tx = client.transaction().await.map_err(map_store_err)?;
            tx.execute("DELETE FROM media WHERE chat_id = $1", &[&chat_id])
                .await
                .map_err(map_store_err)?;
            tx.execute("DELETE FROM reactions WHERE chat_id = $1", &[&chat_id])
                .await
                .map_err(map_store_err)?;
            tx.execute("DELETE FROM messages WHERE chat_id = $1", &[&chat_id])
                .await
                .map_err(map_store_err)?;
            tx.execute("DELETE FROM sync_status WHERE chat_id = $1", &[&chat_id])
                .await
                .map_err(map_store_err)?;
            tx.execute("DELETE FROM chats WHERE id = $1", &[&chat_id])
                .await
                .map_err(map_store_err)?;
            tx.commit().await.map_err(map_store_err)?;
            Ok(())
        })
        .await?;
        info!(chat_id, "deleted chat and related rows");
        if let Some(root) = media_root {
            remove_chat_files(root, chat_id).await;
        }
        Ok(())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), DomainError> {
        with_retry("upsert_user", || async {
            let client = self.client().await?;
            let now = now_utc_naive();
            client
                .execute(
                    r#"
                    INSERT INTO users (id, username, first_name, last_name, phone, is_bot,
                                       created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                    ON CONFLICT (id) DO UPDATE SET
                        username = excluded.username,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        phone = excluded.phone,
                        is_bot = excluded.is_bot,
                        updated_at = excluded.updated_at
                    "#,
                    &[
                        &user.id,
                        &user.username,
                        &user.first_name,
                        &user.last_name,
                        &user.phone,
                        &(user.is_bot as i32),
                        &now,
                    ],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<(), DomainError> {
        self.insert_messages_batch(std::slice::from_ref(message))
            .await
    }

    async fn insert_messages_batch(&self, messages: &[MessageRecord]) -> Result<(), DomainError> {
        if messages.is_empty() {
            return Ok(());
        }
        with_retry("insert_messages_batch", || async {
            let mut client = self.client().await?;
            let tx = client.transaction().await.map_err(map_store_err)?;
            let stmt = tx.prepare(MESSAGE_UPSERT).await.map_err(map_store_err)?;
            let now = now_utc_naive();
            for m in messages {
                let media_type = m.media_type.map(|k| k.as_str());
                let raw = m.raw_data.to_json();
                tx.execute(
                    &stmt,
                    &[
                        &m.id,
                        &m.chat_id,
                        &m.sender_id,
                        &m.date,
                        &m.text,
                        &m.reply_to_msg_id,
                        &m.reply_to_text,
                        &m.forward_from_id,
                        &m.edit_date,
                        &media_type,
                        &m.media_id,
                        &m.media_path,
                        &raw,
                        &now,
                        &(m.is_outgoing as i32),
                    ],
                )
                .await
                .map_err(map_store_err)?;
            }
            tx.commit().await.map_err(map_store_err)?;
            Ok(())
        })
        .await?;
        debug!(count = messages.len(), "message batch upserted");
        Ok(())
    }

    async fn update_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        edit_date: Option<NaiveDateTime>,
    ) -> Result<(), DomainError> {
        with_retry("update_message_text", || async {
            let client = self.client().await?;
            client
                .execute(
                    "UPDATE messages SET text = $1, edit_date = $2 WHERE chat_id = $3 AND id = $4",
                    &[&text, &edit_date, &chat_id, &message_id],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DomainError> {
        with_retry("delete_message", || async {
            let mut client = self.client().await?;
            let tx = client.transaction().await.map_err(map_store_err)?;
            tx.execute(
                "DELETE FROM media WHERE chat_id = $1 AND message_id = $2",
                &[&chat_id, &message_id],
            )
            .await
            .map_err(map_store_err)?;
            tx.execute(
                "DELETE FROM reactions WHERE chat_id = $1 AND message_id = $2",
                &[&chat_id, &message_id],
            )
            .await
            .map_err(map_store_err)?;
            tx.execute(
                "DELETE FROM messages WHERE chat_id = $1 AND id = $2",
                &[&chat_id, &message_id],
            )
            .await
            .map_err(map_store_err)?;
            tx.commit().await.map_err(map_store_err)?;
            Ok(())
        })
        .await?;
        debug!(chat_id, message_id, "message deleted");
        Ok(())
    }

    async fn delete_message_by_id_any_chat(&self, message_id: i64) -> Result<bool, DomainError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT chat_id FROM messages WHERE id = $1",
                &[&message_id],
            )
            .await
            .map_err(map_store_err)?;
        if rows.is_empty() {
            return Ok(false);
        }
        let chat_ids: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();
        drop(client);
        for chat_id in &chat_ids {
            self.delete_message(*chat_id, message_id).await?;
        }
        debug!(message_id, chats = chat_ids.len(), "deleted by id without chat");
        Ok(true)
    }

    async fn backfill_outgoing(&self, owner_id: i64) -> Result<u64, DomainError> {
        let client = self.client().await?;
        let changed = client
            .execute(
                r#"
                UPDATE messages SET is_outgoing = 1
                WHERE sender_id = $1 AND (is_outgoing = 0 OR is_outgoing IS NULL)
                "#,
                &[&owner_id],
            )
            .await
            .map_err(map_store_err)?;
        if changed > 0 {
            info!(owner_id, rows = changed, "backfilled is_outgoing");
        }
        Ok(changed)
    }

    async fn get_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<String>, DomainError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT text FROM messages WHERE chat_id = $1 AND id = $2",
                &[&chat_id, &message_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(row.and_then(|r| r.try_get(0).unwrap_or(None)))
    }

    async fn get_messages_paginated(
        &self,
        query: &MessageQuery,
    ) -> Result<Vec<MessageView>, DomainError> {
        let client = self.client().await?;
        let limit = query.limit as i64;
        let offset = query.offset as i64;
        let pattern = query.search.as_ref().map(|s| format!("%{s}%"));
        let cursor = match (query.before_date, query.before_id) {
            (Some(date), Some(id)) => Some((date, id)),
            _ => None,
        };
        let order = " ORDER BY m.date DESC, m.id DESC LIMIT $90 OFFSET $91";

        let mut sql = format!("{MESSAGE_VIEW_SELECT} WHERE m.chat_id = $1");
        let mut args: Vec<&(dyn ToSql + Sync)> = vec![&query.chat_id];
        if let Some(pattern) = &pattern {
            sql.push_str(&format!(" AND m.text ILIKE ${}", args.len() + 1));
            args.push(pattern);
        }
        if let Some((date, id)) = &cursor {
            let d = args.len() + 1;
            sql.push_str(&format!(
                " AND (m.date < ${d} OR (m.date = ${d} AND m.id < ${}))",
                d + 1
            ));
            args.push(date);
            args.push(id);
        }
        let order = order
            .replace("$90", &format!("${}", args.len() + 1))
            .replace("$91", &format!("${}", args.len() + 2));
        sql.push_str(&order);
        args.push(&limit);
        args.push(&offset);

        let rows = client.query(&sql, &args).await.map_err(map_store_err)?;
        drop(client);
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(Self::view_from_row(&row)?);
        }
        for view in &mut views {
            self.enrich_view(view).await?;
        }
        Ok(views)
    }

    async fn find_message_by_date_with_joins(
        &self,
        chat_id: i64,
        target: NaiveDateTime,
    ) -> Result<Option<MessageView>, DomainError> {
        let client = self.client().await?;
        let attempts: [(String, bool); 3] = [
            (
                format!(
                    "{MESSAGE_VIEW_SELECT} WHERE m.chat_id = $1 AND m.date >= $2 \
                     ORDER BY m.date ASC LIMIT 1"
                ),
                true,
            ),
            (
                format!(
                    "{MESSAGE_VIEW_SELECT} WHERE m.chat_id = $1 AND m.date < $2 \
                     ORDER BY m.date DESC LIMIT 1"
                ),
                true,
            ),
            (
                format!("{MESSAGE_VIEW_SELECT} WHERE m.chat_id = $1 ORDER BY m.date ASC LIMIT 1"),
                false,
            ),
        ];
        for (sql, with_date) in &attempts {
            let row = if *with_date {
                client.query_opt(sql, &[&chat_id, &target]).await
            } else {
                client.query_opt(sql, &[&chat_id]).await
            }
            .map_err(map_store_err)?;
            if let Some(row) = row {
                drop(client);
                let mut view = Self::view_from_row(&row)?;
                self.enrich_view(&mut view).await?;
                return Ok(Some(view));
            }
        }
        Ok(None)
    }

    async fn get_export_page(
        &self,
        chat_id: i64,
        after_date: Option<NaiveDateTime>,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<ExportRow>, DomainError> {
        let client = self.client().await?;
        let select = r#"
            SELECT m.id, m.date, m.text, m.is_outgoing, m.reply_to_msg_id,
                   u.first_name, u.last_name, u.username
            FROM messages m
            LEFT JOIN users u ON m.sender_id = u.id
        "#;
        let limit = limit as i64;
        let rows = match after_date {
            Some(date) => {
                let sql = format!(
                    "{select} WHERE m.chat_id = $1 AND (m.date > $2 OR (m.date = $2 AND m.id > $3)) \
                     ORDER BY m.date ASC, m.id ASC LIMIT $4"
                );
                client
                    .query(&sql, &[&chat_id, &date, &after_id, &limit])
                    .await
            }
            None => {
                let sql =
                    format!("{select} WHERE m.chat_id = $1 ORDER BY m.date ASC, m.id ASC LIMIT $2");
                client.query(&sql, &[&chat_id, &limit]).await
            }
        }
        .map_err(map_store_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let first: Option<String> = row.try_get(5).unwrap_or(None);
            let last: Option<String> = row.try_get(6).unwrap_or(None);
            let username: Option<String> = row.try_get(7).unwrap_or(None);
            let name = format!(
                "{} {}",
                first.as_deref().unwrap_or(""),
                last.as_deref().unwrap_or("")
            );
            let name = name.trim().to_string();
            let date: Option<NaiveDateTime> = row.try_get(1).unwrap_or(None);
            out.push(ExportRow {
                id: row.try_get(0).map_err(map_store_err)?,
                date: date.map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
                sender: ExportSender {
                    name: if name.is_empty() {
                        username.clone().unwrap_or_else(|| "Unknown".into())
                    } else {
                        name
                    },
                    username,
                },
                text: row.try_get(2).unwrap_or(None),
                is_outgoing: row.try_get::<_, i32>(3).unwrap_or(0) != 0,
                reply_to: row.try_get(4).unwrap_or(None),
            });
        }
        Ok(out)
    }

    async fn get_messages_sync_data(
        &self,
        chat_id: i64,
    ) -> Result<HashMap<i64, Option<NaiveDateTime>>, DomainError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, edit_date FROM messages WHERE chat_id = $1",
                &[&chat_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(rows
            .iter()
            .map(|r| (r.get(0), r.try_get(1).unwrap_or(None)))
            .collect())
    }

    async fn insert_media(&self, media: &MediaRecord) -> Result<(), DomainError> {
        with_retry("insert_media", || async {
            let client = self.client().await?;
            let now = now_utc_naive();
            client
                .execute(
                    r#"
                    INSERT INTO media (id, message_id, chat_id, type, file_path, file_name,
                                       file_size, mime_type, width, height, duration,
                                       downloaded, download_date, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT (id) DO UPDATE SET
                        message_id = excluded.message_id,
                        chat_id = excluded.chat_id,
                        type = excluded.type,
                        file_path = excluded.file_path,
                        file_name = excluded.file_name,
                        file_size = excluded.file_size,
                        mime_type = excluded.mime_type,
                        width = excluded.width,
                        height = excluded.height,
                        duration = excluded.duration,
                        downloaded = excluded.downloaded,
                        download_date = excluded.download_date
                    "#,
                    &[
                        &media.id,
                        &media.message_id,
                        &media.chat_id,
                        &media.kind.as_str(),
                        &media.file_path,
                        &media.file_name,
                        &media.file_size,
                        &media.mime_type,
                        &media.width,
                        &media.height,
                        &media.duration,
                        &(media.downloaded as i32),
                        &media.download_date,
                        &now,
                    ],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_media_for_verification(&self) -> Result<Vec<MediaRecord>, DomainError> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT id, message_id, chat_id, type, file_path, file_name, file_size,
                       mime_type, width, height, duration, downloaded, download_date
                FROM media
                WHERE downloaded = 1 OR file_path IS NOT NULL
                ORDER BY chat_id, message_id
                "#,
                &[],
            )
            .await
            .map_err(map_store_err)?;
        rows.iter().map(Self::media_from_row).collect()
    }

    async fn mark_media_for_redownload(&self, media_id: &str) -> Result<(), DomainError> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                UPDATE media SET downloaded = 0, file_path = NULL, download_date = NULL
                WHERE id = $1
                "#,
                &[&media_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(())
    }

    async fn insert_reactions(
        &self,
        message_id: i64,
        chat_id: i64,
        reactions: &[crate::domain::ReactionRow],
    ) -> Result<(), DomainError> {
        with_retry("insert_reactions", || async {
            let mut client = self.client().await?;
            let tx = client.transaction().await.map_err(map_store_err)?;
            tx.execute(
                "DELETE FROM reactions WHERE message_id = $1 AND chat_id = $2",
                &[&message_id, &chat_id],
            )
            .await
            .map_err(map_store_err)?;
            let now = now_utc_naive();
            for r in reactions {
                tx.execute(
                    r#"
                    INSERT INTO reactions (message_id, chat_id, emoji, user_id, count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                    &[
                        &message_id,
                        &chat_id,
                        &r.emoji,
                        &r.user_id,
                        &(r.count as i32),
                        &now,
                    ],
                )
                .await
                .map_err(map_store_err)?;
            }
            tx.commit().await.map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_reactions(
        &self,
        message_id: i64,
        chat_id: i64,
    ) -> Result<Vec<crate::domain::ReactionRow>, DomainError> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT emoji, user_id, count FROM reactions
                WHERE message_id = $1 AND chat_id = $2
                ORDER BY emoji, id
                "#,
                &[&message_id, &chat_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(rows
            .iter()
            .map(|r| crate::domain::ReactionRow {
                emoji: r.get(0),
                user_id: r.try_get(1).unwrap_or(None),
                count: r.try_get::<_, i32>(2).unwrap_or(1) as i64,
            })
            .collect())
    }

    async fn get_last_message_id(&self, chat_id: i64) -> Result<i64, DomainError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT last_message_id FROM sync_status WHERE chat_id = $1",
                &[&chat_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    async fn update_sync_status(
        &self,
        chat_id: i64,
        last_message_id: i64,
        increment: i64,
    ) -> Result<(), DomainError> {
        with_retry("update_sync_status", || async {
            let client = self.client().await?;
            let now = now_utc_naive();
            client
                .execute(
                    r#"
                    INSERT INTO sync_status (chat_id, last_message_id, last_sync_date, message_count)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (chat_id) DO UPDATE SET
                        last_message_id = excluded.last_message_id,
                        last_sync_date = excluded.last_sync_date,
                        message_count = sync_status.message_count + excluded.message_count
                    "#,
                    &[&chat_id, &last_message_id, &now, &(increment as i32)],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), DomainError> {
        with_retry("set_metadata", || async {
            let client = self.client().await?;
            client
                .execute(
                    r#"
                    INSERT INTO metadata (key, value) VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = excluded.value
                    "#,
                    &[&key, &value],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, DomainError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT value FROM metadata WHERE key = $1", &[&key])
            .await
            .map_err(map_store_err)?;
        Ok(row.and_then(|r| r.try_get(0).unwrap_or(None)))
    }

    async fn delete_metadata(&self, key: &str) -> Result<(), DomainError> {
        let client = self.client().await?;
        client
            .execute("DELETE FROM metadata WHERE key = $1", &[&key])
            .await
            .map_err(map_store_err)?;
        Ok(())
    }

    async fn compute_statistics(&self) -> Result<Statistics, DomainError> {
        let client = self.client().await?;
        let chats: i64 = client
            .query_one("SELECT COUNT(*) FROM chats", &[])
            .await
            .map_err(map_store_err)?
            .get(0);
        let messages: i64 = client
            .query_one("SELECT COUNT(*) FROM messages", &[])
            .await
            .map_err(map_store_err)?
            .get(0);
        let media_files: i64 = client
            .query_one("SELECT COUNT(*) FROM media WHERE downloaded = 1", &[])
            .await
            .map_err(map_store_err)?
            .get(0);
        let total_size: i64 = client
            .query_one(
                "SELECT COALESCE(SUM(file_size), 0) FROM media WHERE downloaded = 1",
                &[],
            )
            .await
            .map_err(map_store_err)?
            .get(0);

        let mut last_backup_time = self.get_metadata(keys::LAST_BACKUP_TIME).await?;
        let mut source = last_backup_time.as_ref().map(|_| "metadata".to_string());
        if last_backup_time.is_none() {
            let row = client
                .query_one("SELECT MAX(last_sync_date) FROM sync_status", &[])
                .await
                .map_err(map_store_err)?;
            if let Some(ts) = row.try_get::<_, Option<NaiveDateTime>>(0).unwrap_or(None) {
                last_backup_time = Some(ts.format("%Y-%m-%dT%H:%M:%S").to_string());
                source = Some("sync_status".into());
            }
        }

        Ok(Statistics {
            chats: chats as u64,
            messages: messages as u64,
            media_files: media_files as u64,
            total_size_mb: (total_size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            last_backup_time,
            last_backup_time_source: source,
        })
    }

    async fn chat_statistics(&self, chat_id: i64) -> Result<ChatStats, DomainError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*), MIN(date), MAX(date) FROM messages WHERE chat_id = $1",
                &[&chat_id],
            )
            .await
            .map_err(map_store_err)?;
        let media_row = client
            .query_one(
                "SELECT COUNT(*) FROM media WHERE chat_id = $1 AND downloaded = 1",
                &[&chat_id],
            )
            .await
            .map_err(map_store_err)?;
        Ok(ChatStats {
            chat_id,
            messages: row.get::<_, i64>(0) as u64,
            media_files: media_row.get::<_, i64>(0) as u64,
            first_message_date: row.try_get(1).unwrap_or(None),
            last_message_date: row.try_get(2).unwrap_or(None),
        })
    }

    async fn health_check(&self) -> Result<(), DomainError> {
        let client = self.client().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(map_store_err)?;
        Ok(())
    }

    async fn upsert_push_subscription(
        &self,
        sub: &PushSubscriptionRecord,
    ) -> Result<(), DomainError> {
        with_retry("upsert_push_subscription", || async {
            let client = self.client().await?;
            let now = now_utc_naive();
            client
                .execute(
                    r#"
                    INSERT INTO push_subscriptions
                        (endpoint, p256dh, auth, chat_id, user_agent, created_at, last_used_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $6)
                    ON CONFLICT (endpoint) DO UPDATE SET
                        p256dh = excluded.p256dh,
                        auth = excluded.auth,
                        chat_id = excluded.chat_id,
                        user_agent = excluded.user_agent,
                        last_used_at = excluded.last_used_at
                    "#,
                    &[
                        &sub.endpoint,
                        &sub.p256dh,
                        &sub.auth,
                        &sub.chat_id,
                        &sub.user_agent,
                        &now,
                    ],
                )
                .await
                .map_err(map_store_err)?;
            Ok(())
        })
        .await
    }

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<(), DomainError> {
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM push_subscriptions WHERE endpoint = $1",
                &[&endpoint],
            )
            .await
            .map_err(map_store_err)?;
        Ok(())
    }

    async fn get_push_subscriptions(
        &self,
        chat_id: Option<i64>,
    ) -> Result<Vec<PushSubscriptionRecord>, DomainError> {
        let client = self.client().await?;
        let select = r#"
            SELECT endpoint, p256dh, auth, chat_id, user_agent, created_at, last_used_at
            FROM push_subscriptions
        "#;
        let rows = match chat_id {
            Some(id) => {
                client
                    .query(
                        &format!("{select} WHERE chat_id IS NULL OR chat_id = $1"),
                        &[&id],
                    )
                    .await
            }
            None => client.query(select, &[]).await,
        }
        .map_err(map_store_err)?;
        Ok(rows
            .iter()
            .map(|r| PushSubscriptionRecord {
                endpoint: r.get(0),
                p256dh: r.get(1),
                auth: r.get(2),
                chat_id: r.try_get(3).unwrap_or(None),
                user_agent: r.try_get(4).unwrap_or(None),
                created_at: r.try_get(5).unwrap_or(None),
                last_used_at: r.try_get(6).unwrap_or(None),
            })
            .collect())
    }
}
