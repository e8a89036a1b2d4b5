//! Shared viewer state: store handle, event hub, auth, avatar cache.

use crate::adapters::http::auth::AuthContext;
use crate::adapters::media::MediaStore;
use crate::adapters::notify::PushManager;
use crate::domain::{ChatKind, NotificationEvent, peer};
use crate::ports::StorePort;
use crate::shared::AppConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast};
use tracing::info;

const AVATAR_CACHE_TTL: Duration = Duration::from_secs(300);
const EVENT_HUB_CAPACITY: usize = 256;

pub struct ViewerState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<dyn StorePort>,
    pub media: MediaStore,
    pub events: broadcast::Sender<NotificationEvent>,
    pub push: Option<PushManager>,
    pub auth: Option<AuthContext>,
    /// Normalised whitelist; empty means every chat is visible.
    display_chat_ids: Vec<i64>,
    avatar_cache: Mutex<HashMap<i64, (Option<String>, Instant)>>,
}

impl ViewerState {
    pub async fn new(
        cfg: Arc<AppConfig>,
        store: Arc<dyn StorePort>,
        push: Option<PushManager>,
    ) -> Arc<Self> {
        let auth = match (&cfg.viewer_username, &cfg.viewer_password) {
            (Some(username), Some(password)) => {
                info!(username = %username, "viewer authentication enabled");
                Some(AuthContext::from_credentials(username, password))
            }
            _ => {
                info!("viewer authentication disabled");
                None
            }
        };
        let display_chat_ids = normalize_display_ids(&cfg.display_chat_ids, store.as_ref()).await;
        if !display_chat_ids.is_empty() {
            info!(chats = ?display_chat_ids, "display mode: viewer restricted");
        }
        let (events, _) = broadcast::channel(EVENT_HUB_CAPACITY);
        Arc::new(Self {
            media: MediaStore::new(cfg.media_path(), cfg.deduplicate_media),
            cfg,
            store,
            events,
            push,
            auth,
            display_chat_ids,
            avatar_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the per-session whitelist admits the chat.
    pub fn display_allowed(&self, chat_id: i64) -> bool {
        self.display_chat_ids.is_empty() || self.display_chat_ids.contains(&chat_id)
    }

    pub fn display_restricted(&self) -> bool {
        !self.display_chat_ids.is_empty()
    }

    /// Avatar URL for a chat, cached for five minutes.
    pub async fn avatar_url(&self, chat_id: i64, kind: ChatKind) -> Option<String> {
        let now = Instant::now();
        {
            let cache = self.avatar_cache.lock().await;
            if let Some((url, stored_at)) = cache.get(&chat_id) {
                if now.duration_since(*stored_at) < AVATAR_CACHE_TTL {
                    return url.clone();
                }
            }
        }
        let url = self
            .media
            .find_current_avatar(kind, chat_id)
            .and_then(|path| {
                path.strip_prefix(self.media.root())
                    .ok()
                    .map(|rel| format!("/media/{}", rel.to_string_lossy().replace('\\', "/")))
            });
        self.avatar_cache
            .lock()
            .await
            .insert(chat_id, (url.clone(), now));
        url
    }
}

/// One-shot id normalisation: a positive id that does not exist in the store
/// is rewritten to its marked-channel counterpart when only that one does.
/// Running it twice changes nothing.
async fn normalize_display_ids(ids: &[i64], store: &dyn StorePort) -> Vec<i64> {
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        let mut resolved = id;
        if id > 0 {
            let exists = matches!(store.get_chat(id).await, Ok(Some(_)));
            if !exists {
                let marked = peer::marked_channel_id(id);
                if matches!(store.get_chat(marked).await, Ok(Some(_))) {
                    info!(id, marked, "display id normalised to marked form");
                    resolved = marked;
                }
            }
        }
        out.push(resolved);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatRecord;
    use crate::ports::MockStorePort;

    fn chat(id: i64) -> ChatRecord {
        ChatRecord {
            id,
            kind: ChatKind::Channel,
            title: Some("News".into()),
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

    #[tokio::test]
    async fn positive_id_is_rewritten_when_only_marked_exists() {
        let mut store = MockStorePort::new();
        store.expect_get_chat().returning(|id| {
            if id == -100123456789 {
                Ok(Some(chat(id)))
            } else {
                Ok(None)
            }
        });
        let out = normalize_display_ids(&[123456789], &store).await;
        assert_eq!(out, vec![-100123456789]);

        // Idempotent: the marked form stays as-is.
        let out = normalize_display_ids(&out, &store).await;
        assert_eq!(out, vec![-100123456789]);
    }

    #[tokio::test]
    async fn existing_positive_id_is_kept() {
        let mut store = MockStorePort::new();
        store
            .expect_get_chat()
            .returning(|id| if id == 1001 { Ok(Some(chat(id))) } else { Ok(None) });
        let out = normalize_display_ids(&[1001], &store).await;
        assert_eq!(out, vec![1001]);
    }
}
