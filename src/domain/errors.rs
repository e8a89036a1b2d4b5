//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Telegram gateway error: {0}")]
    TgGateway(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Transient store failure (busy/locked/connection lost). The retry layer
    /// absorbs these; callers only see one after retries are exhausted.
    #[error("Store busy: {0}")]
    StoreBusy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Web Push error: {0}")]
    Push(String),

    /// Upstream rate limit: the current per-chat loop should skip the chat
    /// for this run instead of aborting the whole pass.
    #[error("FloodWait: retry after {seconds} seconds")]
    FloodWait { seconds: u64 },

    /// The upstream object is gone (message deleted, chat inaccessible).
    /// The corresponding local reconciliation step is abandoned.
    #[error("Upstream object missing: {0}")]
    NotFound(String),
}

impl DomainError {
    /// True when the underlying failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::StoreBusy(_))
    }
}
