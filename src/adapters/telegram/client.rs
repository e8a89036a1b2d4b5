//! Implements TgGateway using the grammers Client.
//!
//! Caches InputPeer handles per marked chat id so history pulls and
//! downloads don't re-enumerate dialogs on every call (avoids FLOOD_WAIT).
//! Raw GetHistory invocations carry the `min_id` cursor for incremental
//! pulls; FloodWait surfaces as a domain error so the per-chat loop can skip
//! the chat for the current run.

use crate::adapters::telegram::mapper;
use crate::domain::{
    ChatInfo, DialogInfo, DomainError, IncomingMessage, TelegramUpdate, UserRecord,
};
use crate::ports::TgGateway;
use async_trait::async_trait;
use grammers_client::{Client, InvocationError, Update, tl};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Telegram gateway adapter. The client handle is cheap to clone; backup and
/// listener may share one gateway over a single authenticated session.
pub struct GrammersTgGateway {
    client: Client,
    /// Whether this process owns the session (and may tear it down).
    owns_session: bool,
    /// InputPeer by marked chat id.
    peer_cache: Mutex<HashMap<i64, tl::enums::InputPeer>>,
    /// Entity snapshot by marked chat id, refreshed on dialog enumeration.
    chat_cache: Mutex<HashMap<i64, ChatInfo>>,
}

impl GrammersTgGateway {
    pub fn new(client: Client, owns_session: bool) -> Self {
        Self {
            client,
            owns_session,
            peer_cache: Mutex::new(HashMap::new()),
            chat_cache: Mutex::new(HashMap::new()),
        }
    }

    fn map_err(e: InvocationError) -> DomainError {
        if let InvocationError::Rpc(rpc) = &e {
            if rpc.code == 420 {
                return DomainError::FloodWait {
                    seconds: rpc.value.unwrap_or(60) as u64,
                };
            }
        }
        DomainError::TgGateway(e.to_string())
    }

    /// Walk the dialog list, refreshing both caches.
    async fn refresh_dialogs(&self) -> Result<Vec<DialogInfo>, DomainError> {
        let mut dialogs = self.client.iter_dialogs();
        let mut out = Vec::new();
        let mut peers = self.peer_cache.lock().await;
        let mut chats = self.chat_cache.lock().await;
        while let Some(dialog) = dialogs.next().await.map_err(Self::map_err)? {
            let chat = &dialog.chat;
            let info = mapper::chat_info_from_chat(chat);
            peers.insert(info.id, chat.pack().to_input_peer());
            chats.insert(info.id, info.clone());
            out.push(DialogInfo {
                last_activity: dialog.last_message.as_ref().map(|m| m.date().timestamp()),
                chat: info,
            });
        }
        debug!(dialogs = out.len(), "dialog enumeration complete");
        Ok(out)
    }

    async fn resolve_input_peer(&self, chat_id: i64) -> Result<tl::enums::InputPeer, DomainError> {
        if let Some(peer) = self.peer_cache.lock().await.get(&chat_id) {
            return Ok(peer.clone());
        }
        self.refresh_dialogs().await?;
        self.peer_cache
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("peer {chat_id} not in dialogs")))
    }

    /// Fetch raw history messages with the given request, returning the raw
    /// message list plus the user entities that came with it.
    async fn invoke_history(
        &self,
        request: &tl::functions::messages::GetHistory,
    ) -> Result<(Vec<tl::enums::Message>, HashMap<i64, tl::types::User>), DomainError> {
        use tl::enums::messages::Messages;

        let raw = self.client.invoke(request).await.map_err(Self::map_err)?;
        let (messages, users) = match raw {
            Messages::Messages(m) => (m.messages, m.users),
            Messages::Slice(m) => (m.messages, m.users),
            Messages::ChannelMessages(m) => (m.messages, m.users),
            Messages::NotModified(_) => (Vec::new(), Vec::new()),
        };
        Ok((messages, index_users(users)))
    }

    /// Fetch raw messages by id (channels use their own call).
    async fn fetch_raw_by_id(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<(Vec<tl::enums::Message>, HashMap<i64, tl::types::User>), DomainError> {
        use tl::enums::messages::Messages;

        let input_peer = self.resolve_input_peer(chat_id).await?;
        let id: Vec<tl::enums::InputMessage> = message_ids
            .iter()
            .map(|&id| tl::types::InputMessageId { id: id as i32 }.into())
            .collect();

        let raw = match &input_peer {
            tl::enums::InputPeer::Channel(channel) => {
                let channel: tl::enums::InputChannel = tl::types::InputChannel {
                    channel_id: channel.channel_id,
                    access_hash: channel.access_hash,
                }
                .into();
                self.client
                    .invoke(&tl::functions::channels::GetMessages { channel, id })
                    .await
                    .map_err(Self::map_err)?
            }
            _ => self
                .client
                .invoke(&tl::functions::messages::GetMessages { id })
                .await
                .map_err(Self::map_err)?,
        };

        let (messages, users) = match raw {
            Messages::Messages(m) => (m.messages, m.users),
            Messages::Slice(m) => (m.messages, m.users),
            Messages::ChannelMessages(m) => (m.messages, m.users),
            Messages::NotModified(_) => (Vec::new(), Vec::new()),
        };
        Ok((messages, index_users(users)))
    }

    async fn download_file(
        &self,
        location: tl::enums::InputFileLocation,
        dest: &Path,
    ) -> Result<(), DomainError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Media(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?;
        let mut download = self.client.iter_download(location);
        while let Some(chunk) = download
            .next()
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| DomainError::Media(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?;
        Ok(())
    }
}

fn index_users(users: Vec<tl::enums::User>) -> HashMap<i64, tl::types::User> {
    users
        .into_iter()
        .filter_map(|u| match u {
            tl::enums::User::User(user) => Some((user.id, user)),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl TgGateway for GrammersTgGateway {
    async fn me(&self) -> Result<UserRecord, DomainError> {
        let mut client = self.client.clone();
        let me = client.get_me().await.map_err(Self::map_err)?;
        Ok(mapper::user_record_from_tl(&me))
    }

    async fn get_dialogs(&self) -> Result<Vec<DialogInfo>, DomainError> {
        self.refresh_dialogs().await
    }

    async fn get_entity(&self, chat_id: i64) -> Result<ChatInfo, DomainError> {
        if let Some(info) = self.chat_cache.lock().await.get(&chat_id) {
            return Ok(info.clone());
        }
        self.refresh_dialogs().await?;
        self.chat_cache
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("entity {chat_id} not accessible")))
    }

    async fn fetch_messages_after(
        &self,
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, DomainError> {
        let peer = self.resolve_input_peer(chat_id).await?;
        // offset_id + negative add_offset returns the page immediately newer
        // than the cursor; min_id guards the lower bound server-side, and the
        // filter below enforces it client-side regardless.
        let request = tl::functions::messages::GetHistory {
            peer,
            offset_id: after_id as i32,
            offset_date: 0,
            add_offset: -(limit as i32),
            limit: limit as i32,
            max_id: 0,
            min_id: after_id as i32,
            hash: 0,
        };
        let (messages, users) = self.invoke_history(&request).await?;
        let mut out: Vec<IncomingMessage> = messages
            .iter()
            .filter_map(|m| mapper::incoming_from_raw(m, chat_id, &users))
            .filter(|m| m.id > after_id)
            .collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }

    async fn get_messages_by_id(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<Vec<Option<IncomingMessage>>, DomainError> {
        let (messages, users) = self.fetch_raw_by_id(chat_id, message_ids).await?;
        let mut found: HashMap<i64, IncomingMessage> = messages
            .iter()
            .filter_map(|m| mapper::incoming_from_raw(m, chat_id, &users))
            .map(|m| (m.id, m))
            .collect();
        Ok(message_ids.iter().map(|id| found.remove(id)).collect())
    }

    async fn download_media(
        &self,
        chat_id: i64,
        message_id: i64,
        dest: &Path,
    ) -> Result<(), DomainError> {
        let (messages, _users) = self.fetch_raw_by_id(chat_id, &[message_id]).await?;
        let media = messages
            .iter()
            .find_map(|m| match m {
                tl::enums::Message::Message(m) if m.id as i64 == message_id => m.media.as_ref(),
                _ => None,
            })
            .ok_or_else(|| {
                DomainError::NotFound(format!("message {message_id} in {chat_id} has no media"))
            })?;
        let location = mapper::download_location(media)
            .ok_or_else(|| DomainError::Media("media has no downloadable location".into()))?;
        self.download_file(location, dest).await?;
        debug!(chat_id, message_id, path = %dest.display(), "media downloaded");
        Ok(())
    }

    async fn download_profile_photo(
        &self,
        chat_id: i64,
        dest: &Path,
    ) -> Result<bool, DomainError> {
        let info = self.get_entity(chat_id).await?;
        let Some(photo_id) = info.photo_id else {
            debug!(chat_id, "no avatar set");
            return Ok(false);
        };
        let peer = self.resolve_input_peer(chat_id).await?;
        let location: tl::enums::InputFileLocation = tl::types::InputPeerPhotoFileLocation {
            big: false,
            peer,
            photo_id,
        }
        .into();
        self.download_file(location, dest).await?;
        info!(chat_id, photo_id, path = %dest.display(), "avatar downloaded");
        Ok(true)
    }

    async fn next_update(&self) -> Result<Option<TelegramUpdate>, DomainError> {
        loop {
            let update = self.client.next_update().await.map_err(Self::map_err)?;
            let Some(update) = update else {
                return Ok(None);
            };
            match update {
                Update::NewMessage(message) => {
                    if let Some(action) = message.action() {
                        if let Some(chat_id) = chat_action_target(&message, action) {
                            return Ok(Some(TelegramUpdate::ChatAction { chat_id }));
                        }
                        continue;
                    }
                    return Ok(Some(TelegramUpdate::NewMessage(
                        mapper::incoming_from_update(&message),
                    )));
                }
                Update::MessageEdited(message) => {
                    return Ok(Some(TelegramUpdate::MessageEdited(
                        mapper::incoming_from_update(&message),
                    )));
                }
                Update::MessageDeleted(deletion) => {
                    let chat_id = deletion
                        .channel_id()
                        .map(crate::domain::peer::marked_channel_id);
                    let message_ids = deletion
                        .messages()
                        .iter()
                        .map(|&id| id as i64)
                        .collect::<Vec<_>>();
                    return Ok(Some(TelegramUpdate::MessagesDeleted {
                        chat_id,
                        message_ids,
                    }));
                }
                _ => continue,
            }
        }
    }

    async fn is_connected(&self) -> bool {
        let mut client = self.client.clone();
        client.is_authorized().await.is_ok()
    }

    async fn disconnect(&self) {
        if !self.owns_session {
            debug!("shared session: leaving disconnect to the owner");
            return;
        }
        // The session storage is already durable; dropping the last client
        // handle closes the transport with the process.
        info!("session owner shutting down client");
    }
}

/// Photo/title/member changes on a service message become chat-action
/// events; anything else is ignored.
fn chat_action_target(
    message: &grammers_client::types::Message,
    action: &tl::enums::MessageAction,
) -> Option<i64> {
    use tl::enums::MessageAction;

    match action {
        MessageAction::ChatEditPhoto(_)
        | MessageAction::ChatDeletePhoto
        | MessageAction::ChatEditTitle(_)
        | MessageAction::ChatAddUser(_)
        | MessageAction::ChatDeleteUser(_) => {
            Some(mapper::marked_id_from_chat(&message.chat()))
        }
        _ => None,
    }
}
