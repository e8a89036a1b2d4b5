//! Session management. Load/save grammers session.
//!
//! Uses grammers-session's SqliteSession for persistent file-based storage so
//! authorization is preserved across restarts. The session is single-owner;
//! when backup and listener share one, only the owner disconnects it.

use grammers_session::storages::SqliteSession;
use std::path::Path;

/// Opens a persistent session storage at the given path, creating parent
/// directories as needed.
pub async fn open_file_session(path: impl AsRef<Path>) -> anyhow::Result<SqliteSession> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create session directory: {}", e))?;
    }
    SqliteSession::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("open session file: {}", e))
}
