//! Storage adapters: one contract, two dialects.
//!
//! `SqliteStore` (embedded, single writer) and `PostgresStore` (client/
//! server) implement `StorePort` with identical semantics. `connect_store`
//! picks the implementation from the resolved configuration.

pub mod postgres_store;
pub mod retry;
pub mod schema;
pub mod sqlite_store;

pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;

use crate::domain::DomainError;
use crate::ports::StorePort;
use crate::shared::StoreSelection;
use std::sync::Arc;

/// Metadata keys shared between the writer processes and the viewer.
pub mod keys {
    pub const OWNER_ID: &str = "owner_id";
    pub const LAST_BACKUP_TIME: &str = "last_backup_time";
    pub const LISTENER_ACTIVE_SINCE: &str = "listener_active_since";
    pub const VAPID_PRIVATE_KEY: &str = "vapid_private_key";
    pub const VAPID_PUBLIC_KEY: &str = "vapid_public_key";
    pub const STATS_CACHE: &str = "stats_cache";
    pub const STATS_CALCULATED_AT: &str = "stats_calculated_at";
}

/// Connect to the configured store and ensure the schema exists.
pub async fn connect_store(selection: &StoreSelection) -> Result<Arc<dyn StorePort>, DomainError> {
    match selection {
        StoreSelection::Sqlite { path } => {
            let store = SqliteStore::connect(path).await?;
            Ok(Arc::new(store))
        }
        StoreSelection::Postgres { conn_string } => {
            let store = PostgresStore::connect(conn_string).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Group stored reaction rows per emoji: counts add up, known reactors are
/// collected. Both dialects serve views through this.
pub(crate) fn group_reactions(
    rows: Vec<crate::domain::ReactionRow>,
) -> Vec<crate::domain::ReactionSummary> {
    let mut out: Vec<crate::domain::ReactionSummary> = Vec::new();
    for row in rows {
        let summary = match out.iter_mut().find(|s| s.emoji == row.emoji) {
            Some(existing) => existing,
            None => {
                out.push(crate::domain::ReactionSummary {
                    emoji: row.emoji.clone(),
                    count: 0,
                    user_ids: Vec::new(),
                });
                out.last_mut().expect("just pushed")
            }
        };
        summary.count += row.count.max(1);
        if let Some(user_id) = row.user_id {
            summary.user_ids.push(user_id);
        }
    }
    out
}

/// First 100 characters of a replied message, the way Telegram previews it.
pub(crate) fn reply_prefix(text: &str) -> String {
    text.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReactionRow;

    #[test]
    fn reactions_group_per_emoji() {
        let grouped = group_reactions(vec![
            ReactionRow { emoji: "👍".into(), user_id: Some(1), count: 1 },
            ReactionRow { emoji: "👍".into(), user_id: None, count: 3 },
            ReactionRow { emoji: "🔥".into(), user_id: Some(2), count: 1 },
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].emoji, "👍");
        assert_eq!(grouped[0].count, 4);
        assert_eq!(grouped[0].user_ids, vec![1]);
        assert_eq!(grouped[1].emoji, "🔥");
    }

    #[test]
    fn reply_prefix_caps_at_100_chars() {
        assert_eq!(reply_prefix("short"), "short");
        assert_eq!(reply_prefix(&"é".repeat(250)).chars().count(), 100);
    }
}
