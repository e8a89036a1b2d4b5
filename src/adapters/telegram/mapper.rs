//! Map grammers types to domain entities.
//!
//! Two paths feed the domain: raw tl messages from history pulls (full
//! fidelity: reactions, polls, forward headers) and the friendly update
//! objects from the live stream. Marked chat ids are produced here and
//! nowhere else.

use crate::domain::peer::{marked_channel_id, marked_group_id};
use crate::domain::{
    ChatInfo, ChatKind, ForwardInfo, IncomingMedia, IncomingMessage, MediaKind, PollAnswer,
    PollAnswerVoters, PollData, PollResults, ReactionSummary, UserRecord,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use grammers_client::tl;
use grammers_client::types::{Chat, Media, Message};
use std::collections::HashMap;

/// Marked id for a raw tl peer.
pub fn marked_id_from_peer(peer: &tl::enums::Peer) -> i64 {
    match peer {
        tl::enums::Peer::User(u) => u.user_id,
        tl::enums::Peer::Chat(c) => marked_group_id(c.chat_id),
        tl::enums::Peer::Channel(c) => marked_channel_id(c.channel_id),
    }
}

/// Marked id for a friendly chat object. Megagroups live in the channel
/// namespace even though they display as groups.
pub fn marked_id_from_chat(chat: &Chat) -> i64 {
    match chat {
        Chat::User(user) => user.id(),
        Chat::Group(group) => {
            if group.is_megagroup() {
                marked_channel_id(group.id())
            } else {
                marked_group_id(group.id())
            }
        }
        Chat::Channel(channel) => marked_channel_id(channel.id()),
    }
}

/// Build a dialog entity from a friendly chat object.
pub fn chat_info_from_chat(chat: &Chat) -> ChatInfo {
    match chat {
        Chat::User(user) => ChatInfo {
            id: user.id(),
            kind: ChatKind::Private,
            title: None,
            username: user.username().map(String::from),
            first_name: user.first_name().map(String::from),
            last_name: user.last_name().map(String::from),
            phone: user.phone().map(String::from),
            description: None,
            participants_count: None,
            photo_id: user.photo().map(|p| p.photo_id),
            is_bot: user.is_bot(),
        },
        Chat::Group(group) => ChatInfo {
            id: marked_id_from_chat(chat),
            kind: ChatKind::Group,
            title: group.title().map(String::from),
            username: group.username().map(String::from),
            first_name: None,
            last_name: None,
            phone: None,
            description: None,
            participants_count: None,
            photo_id: None,
            is_bot: false,
        },
        Chat::Channel(channel) => ChatInfo {
            id: marked_channel_id(channel.id()),
            kind: ChatKind::Channel,
            title: Some(channel.title().to_string()),
            username: channel.username().map(String::from),
            first_name: None,
            last_name: None,
            phone: None,
            description: None,
            participants_count: None,
            photo_id: channel.photo().map(|p| p.photo_id),
            is_bot: false,
        },
    }
}

/// Map a raw tl user into the sender record.
pub fn user_record_from_tl(user: &tl::types::User) -> UserRecord {
    UserRecord {
        id: user.id,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        phone: user.phone.clone(),
        is_bot: user.bot,
    }
}

fn date_from_epoch(epoch: i32) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(epoch as i64, 0).unwrap_or_else(Utc::now)
}

/// Map a raw history message. Returns `None` for empty and service entries;
/// service messages never reach the archive (chat actions are observed on
/// the live path instead).
pub fn incoming_from_raw(
    msg: &tl::enums::Message,
    chat_id: i64,
    users: &HashMap<i64, tl::types::User>,
) -> Option<IncomingMessage> {
    let m = match msg {
        tl::enums::Message::Message(m) => m,
        tl::enums::Message::Empty(_) | tl::enums::Message::Service(_) => return None,
    };

    let sender_id = m.from_id.as_ref().map(marked_id_from_peer);
    let sender = m.from_id.as_ref().and_then(|peer| match peer {
        tl::enums::Peer::User(u) => users.get(&u.user_id).map(user_record_from_tl),
        _ => None,
    });

    let reply_to_msg_id = m
        .reply_to
        .as_ref()
        .and_then(|r| match r {
            tl::enums::MessageReplyHeader::Header(h) => Some(h.reply_to_msg_id),
            _ => None,
        })
        .flatten()
        .map(|id| id as i64);

    let forward = m.fwd_from.as_ref().map(|fwd| match fwd {
        tl::enums::MessageFwdHeader::Header(h) => ForwardInfo {
            from_id: h.from_id.as_ref().map(marked_id_from_peer),
            from_name: h.from_name.clone(),
        },
    });

    let (media, poll) = match m.media.as_ref() {
        Some(tl::enums::MessageMedia::Poll(p)) => (None, Some(extract_poll(p))),
        Some(other) => (extract_media(other), None),
        None => (None, None),
    };

    Some(IncomingMessage {
        id: m.id as i64,
        chat_id,
        date: date_from_epoch(m.date),
        text: m.message.clone(),
        sender,
        sender_id,
        reply_to_msg_id,
        forward,
        edit_date: m.edit_date.map(date_from_epoch),
        outgoing: m.out,
        grouped_id: m.grouped_id,
        post_author: m.post_author.clone(),
        media,
        poll,
        reactions: extract_reactions(m.reactions.as_ref()),
    })
}

/// Map a friendly message from the update stream. Polls and per-emoji
/// reactions are not visible on this path; the next backup pass completes
/// them from raw history.
pub fn incoming_from_update(msg: &Message) -> IncomingMessage {
    let chat_id = marked_id_from_chat(&msg.chat());
    let sender = msg.sender().and_then(|chat| match chat {
        Chat::User(user) => Some(UserRecord {
            id: user.id(),
            username: user.username().map(String::from),
            first_name: user.first_name().map(String::from),
            last_name: user.last_name().map(String::from),
            phone: user.phone().map(String::from),
            is_bot: user.is_bot(),
        }),
        _ => None,
    });
    let sender_id = msg
        .sender()
        .map(|chat| marked_id_from_chat(&chat))
        .or(sender.as_ref().map(|u| u.id));

    let forward = msg.forward_header().map(|fwd| match fwd {
        tl::enums::MessageFwdHeader::Header(h) => ForwardInfo {
            from_id: h.from_id.as_ref().map(marked_id_from_peer),
            from_name: h.from_name.clone(),
        },
    });

    IncomingMessage {
        id: msg.id() as i64,
        chat_id,
        date: msg.date(),
        text: msg.text().to_string(),
        sender,
        sender_id,
        reply_to_msg_id: msg.reply_to_message_id().map(|id| id as i64),
        forward,
        edit_date: msg.edit_date(),
        outgoing: msg.outgoing(),
        grouped_id: msg.grouped_id(),
        post_author: msg.post_author().map(String::from),
        media: msg.media().as_ref().and_then(media_from_friendly),
        poll: None,
        reactions: Vec::new(),
    }
}

fn media_from_friendly(media: &Media) -> Option<IncomingMedia> {
    match media {
        Media::Photo(photo) => Some(IncomingMedia {
            file_id: photo.id(),
            kind: MediaKind::Photo,
            size: 0,
            mime_type: Some("image/jpeg".into()),
            original_name: None,
            width: None,
            height: None,
            duration: None,
        }),
        Media::Document(document) => Some(IncomingMedia {
            file_id: document.id(),
            kind: classify_mime(document.mime_type()),
            size: document.size() as i64,
            mime_type: document.mime_type().map(String::from),
            original_name: Some(document.name())
                .filter(|n| !n.is_empty())
                .map(String::from),
            width: None,
            height: None,
            duration: None,
        }),
        Media::Sticker(sticker) => Some(IncomingMedia {
            file_id: sticker.document.id(),
            kind: MediaKind::Sticker,
            size: sticker.document.size() as i64,
            mime_type: sticker.document.mime_type().map(String::from),
            original_name: None,
            width: None,
            height: None,
            duration: None,
        }),
        _ => None,
    }
}

fn classify_mime(mime: Option<&str>) -> MediaKind {
    match mime {
        Some(m) if m.starts_with("video/") => MediaKind::Video,
        Some(m) if m.starts_with("audio/") => MediaKind::Audio,
        Some("application/x-tgsticker") => MediaKind::Sticker,
        Some(m) if m == "image/gif" => MediaKind::Animation,
        _ => MediaKind::Document,
    }
}

/// Extract downloadable media info from a raw tl media payload. Polls are
/// handled separately and never downloaded.
pub fn extract_media(media: &tl::enums::MessageMedia) -> Option<IncomingMedia> {
    match media {
        tl::enums::MessageMedia::Photo(p) => {
            let photo = match p.photo.as_ref()? {
                tl::enums::Photo::Photo(photo) => photo,
                tl::enums::Photo::Empty(_) => return None,
            };
            let (size, width, height) = largest_photo_size(&photo.sizes);
            Some(IncomingMedia {
                file_id: photo.id,
                kind: MediaKind::Photo,
                size,
                mime_type: Some("image/jpeg".into()),
                original_name: None,
                width,
                height,
                duration: None,
            })
        }
        tl::enums::MessageMedia::Document(d) => {
            let doc = match d.document.as_ref()? {
                tl::enums::Document::Document(doc) => doc,
                tl::enums::Document::Empty(_) => return None,
            };
            let mut kind = MediaKind::Document;
            let mut animated = false;
            let mut name = None;
            let mut width = None;
            let mut height = None;
            let mut duration = None;
            for attr in &doc.attributes {
                match attr {
                    tl::enums::DocumentAttribute::Animated => animated = true,
                    tl::enums::DocumentAttribute::Video(v) => {
                        kind = MediaKind::Video;
                        width = Some(v.w);
                        height = Some(v.h);
                        duration = Some(v.duration as i32);
                    }
                    tl::enums::DocumentAttribute::Audio(a) => {
                        kind = if a.voice {
                            MediaKind::Voice
                        } else {
                            MediaKind::Audio
                        };
                        duration = Some(a.duration);
                    }
                    tl::enums::DocumentAttribute::Sticker(_) => kind = MediaKind::Sticker,
                    tl::enums::DocumentAttribute::ImageSize(s) => {
                        width = Some(s.w);
                        height = Some(s.h);
                    }
                    tl::enums::DocumentAttribute::Filename(f) => {
                        name = Some(f.file_name.clone());
                    }
                    _ => {}
                }
            }
            if animated && kind != MediaKind::Sticker {
                kind = MediaKind::Animation;
            }
            Some(IncomingMedia {
                file_id: doc.id,
                kind,
                size: doc.size,
                mime_type: Some(doc.mime_type.clone()),
                original_name: name,
                width,
                height,
                duration,
            })
        }
        tl::enums::MessageMedia::Contact(_) => Some(IncomingMedia {
            file_id: 0,
            kind: MediaKind::Contact,
            size: 0,
            mime_type: None,
            original_name: None,
            width: None,
            height: None,
            duration: None,
        }),
        tl::enums::MessageMedia::Geo(_) => Some(IncomingMedia {
            file_id: 0,
            kind: MediaKind::Geo,
            size: 0,
            mime_type: None,
            original_name: None,
            width: None,
            height: None,
            duration: None,
        }),
        _ => None,
    }
}

fn largest_photo_size(sizes: &[tl::enums::PhotoSize]) -> (i64, Option<i32>, Option<i32>) {
    let mut best = (0i64, None, None);
    for size in sizes {
        let (bytes, w, h) = match size {
            tl::enums::PhotoSize::Size(s) => (s.size as i64, Some(s.w), Some(s.h)),
            tl::enums::PhotoSize::Progressive(s) => (
                s.sizes.iter().copied().max().unwrap_or(0) as i64,
                Some(s.w),
                Some(s.h),
            ),
            _ => continue,
        };
        if bytes >= best.0 {
            best = (bytes, w, h);
        }
    }
    best
}

/// Serialise a poll into its raw_data shape. Option bytes are base64.
pub fn extract_poll(media: &tl::types::MessageMediaPoll) -> PollData {
    let tl::enums::Poll::Poll(poll) = &media.poll;
    let results = match &media.results {
        tl::enums::PollResults::Results(r) => Some(PollResults {
            total_voters: r.total_voters,
            results: r
                .results
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|v| {
                    let tl::enums::PollAnswerVoters::Voters(v) = v;
                    PollAnswerVoters {
                        option: BASE64.encode(&v.option),
                        voters: v.voters,
                        correct: Some(v.correct),
                    }
                })
                .collect(),
        }),
    };
    PollData {
        id: Some(poll.id),
        question: text_of(&poll.question),
        answers: poll
            .answers
            .iter()
            .map(|a| {
                let tl::enums::PollAnswer::Answer(a) = a;
                PollAnswer {
                    text: text_of(&a.text),
                    option: BASE64.encode(&a.option),
                }
            })
            .collect(),
        closed: poll.closed,
        public_voters: poll.public_voters,
        multiple_choice: poll.multiple_choice,
        quiz: poll.quiz,
        results,
    }
}

fn text_of(text: &tl::enums::TextWithEntities) -> String {
    let tl::enums::TextWithEntities::Entities(t) = text;
    t.text.clone()
}

/// Collect per-emoji reaction aggregates, attributing recent reactors.
pub fn extract_reactions(reactions: Option<&tl::enums::MessageReactions>) -> Vec<ReactionSummary> {
    let Some(tl::enums::MessageReactions::Reactions(reactions)) = reactions else {
        return Vec::new();
    };
    let recent = reactions.recent_reactions.as_deref().unwrap_or_default();
    reactions
        .results
        .iter()
        .filter_map(|count| {
            let tl::enums::ReactionCount::Count(count) = count;
            let emoji = reaction_key(&count.reaction)?;
            let user_ids = recent
                .iter()
                .filter_map(|peer_reaction| {
                    let tl::enums::MessagePeerReaction::Reaction(pr) = peer_reaction;
                    if reaction_key(&pr.reaction).as_deref() == Some(emoji.as_str()) {
                        Some(marked_id_from_peer(&pr.peer_id))
                    } else {
                        None
                    }
                })
                .collect();
            Some(ReactionSummary {
                emoji,
                count: count.count as i64,
                user_ids,
            })
        })
        .collect()
}

fn reaction_key(reaction: &tl::enums::Reaction) -> Option<String> {
    match reaction {
        tl::enums::Reaction::Emoji(e) => Some(e.emoticon.clone()),
        tl::enums::Reaction::CustomEmoji(e) => Some(format!("custom_{}", e.document_id)),
        _ => None,
    }
}

/// Download location for a raw media payload, when it has one.
pub fn download_location(media: &tl::enums::MessageMedia) -> Option<tl::enums::InputFileLocation> {
    match media {
        tl::enums::MessageMedia::Photo(p) => match p.photo.as_ref()? {
            tl::enums::Photo::Photo(photo) => {
                let thumb = photo
                    .sizes
                    .iter()
                    .filter_map(|s| match s {
                        tl::enums::PhotoSize::Size(s) => Some((s.size, s.r#type.clone())),
                        tl::enums::PhotoSize::Progressive(s) => Some((
                            s.sizes.iter().copied().max().unwrap_or(0),
                            s.r#type.clone(),
                        )),
                        _ => None,
                    })
                    .max_by_key(|(size, _)| *size)
                    .map(|(_, t)| t)?;
                Some(
                    tl::types::InputPhotoFileLocation {
                        id: photo.id,
                        access_hash: photo.access_hash,
                        file_reference: photo.file_reference.clone(),
                        thumb_size: thumb,
                    }
                    .into(),
                )
            }
            tl::enums::Photo::Empty(_) => None,
        },
        tl::enums::MessageMedia::Document(d) => match d.document.as_ref()? {
            tl::enums::Document::Document(doc) => Some(
                tl::types::InputDocumentFileLocation {
                    id: doc.id,
                    access_hash: doc.access_hash,
                    file_reference: doc.file_reference.clone(),
                    thumb_size: String::new(),
                }
                .into(),
            ),
            tl::enums::Document::Empty(_) => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_are_marked() {
        let user = tl::enums::Peer::User(tl::types::PeerUser { user_id: 1001 });
        let group = tl::enums::Peer::Chat(tl::types::PeerChat { chat_id: 987654321 });
        let channel = tl::enums::Peer::Channel(tl::types::PeerChannel {
            channel_id: 123456789,
        });
        assert_eq!(marked_id_from_peer(&user), 1001);
        assert_eq!(marked_id_from_peer(&group), -987654321);
        assert_eq!(marked_id_from_peer(&channel), -100123456789);
    }

    #[test]
    fn mime_classification() {
        assert_eq!(classify_mime(Some("video/mp4")), MediaKind::Video);
        assert_eq!(classify_mime(Some("audio/ogg")), MediaKind::Audio);
        assert_eq!(classify_mime(Some("application/pdf")), MediaKind::Document);
        assert_eq!(classify_mime(Some("application/x-tgsticker")), MediaKind::Sticker);
        assert_eq!(classify_mime(None), MediaKind::Document);
    }
}
