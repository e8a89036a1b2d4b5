//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;
pub mod events;
pub mod peer;

pub use entities::{
    ChatInfo, ChatKind, ChatOverview, ChatPage, ChatRecord, ChatStats, DialogInfo, ExportRow,
    ExportSender, ForwardInfo, IncomingMedia, IncomingMessage, MediaKind, MediaRecord,
    MessageQuery, MessageRecord, MessageView, PollAnswer, PollAnswerVoters, PollData, PollResults,
    PushSubscriptionRecord, RawData, ReactionRow, ReactionSummary, Statistics, TelegramUpdate,
    UserRecord, expand_reactions,
};
pub use errors::DomainError;
pub use events::{NotificationEvent, NotificationKind};
