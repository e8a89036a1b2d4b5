//! On-disk media layout, deduplication and avatar naming.
//!
//! Layout under the media root:
//!   `<chat_id>/<file>`              chat-scoped reference
//!   `_shared/<file>`                dedup pool (first sighting downloads here)
//!   `avatars/users/<id>_<photo>.jpg`
//!   `avatars/chats/<id>_<photo>.jpg`
//!
//! The chat entry is a relative symlink into the pool; when the platform
//! refuses symlinks the bytes are copied (or the pool copy is moved), so the
//! stored file_path always resolves to readable bytes.

use crate::domain::{ChatKind, MediaKind};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SHARED_DIR: &str = "_shared";

/// Where a media file should land, decided before talking to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPlacement {
    /// The chat-scoped path already resolves; nothing to transfer.
    Existing(PathBuf),
    /// The pool already has the bytes; only the chat reference is missing.
    NeedsLink { shared: PathBuf, chat: PathBuf },
    /// Fresh content: download to `download_to`, then reference from `chat`.
    NeedsDownload {
        download_to: PathBuf,
        chat: PathBuf,
        via_shared: bool,
    },
}

/// Result of checking one media row against the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCheck {
    Ok,
    Missing,
    Empty,
    SizeMismatch,
}

#[derive(Clone)]
pub struct MediaStore {
    root: PathBuf,
    deduplicate: bool,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, deduplicate: bool) -> Self {
        Self {
            root: root.into(),
            deduplicate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chat_dir(&self, chat_id: i64) -> PathBuf {
        self.root.join(chat_id.to_string())
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(SHARED_DIR)
    }

    pub fn avatar_dir(&self, kind: ChatKind) -> PathBuf {
        let folder = match kind {
            ChatKind::Private => "users",
            _ => "chats",
        };
        self.root.join("avatars").join(folder)
    }

    /// Target avatar file for the entity's current photo.
    pub fn avatar_path(&self, kind: ChatKind, chat_id: i64, photo_id: i64) -> PathBuf {
        self.avatar_dir(kind).join(format!("{chat_id}_{photo_id}.jpg"))
    }

    /// The newest on-disk avatar for a chat: any `<id>_*.jpg`, plus the
    /// historical `<id>.jpg` name, newest mtime wins.
    pub fn find_current_avatar(&self, kind: ChatKind, chat_id: i64) -> Option<PathBuf> {
        let dir = self.avatar_dir(kind);
        let entries = std::fs::read_dir(&dir).ok()?;
        let prefix = format!("{chat_id}_");
        let legacy = format!("{chat_id}.jpg");
        let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let matches = name == legacy
                || (name.starts_with(&prefix) && name.ends_with(".jpg"));
            if !matches {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            if best.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                best = Some((mtime, entry.path()));
            }
        }
        best.map(|(_, path)| path)
    }

    /// Decide where a file goes, creating the needed directories.
    pub async fn plan(&self, chat_id: i64, file_name: &str) -> io::Result<MediaPlacement> {
        let chat_dir = self.chat_dir(chat_id);
        tokio::fs::create_dir_all(&chat_dir).await?;
        let chat_path = chat_dir.join(file_name);
        if tokio::fs::try_exists(&chat_path).await.unwrap_or(false) {
            return Ok(MediaPlacement::Existing(chat_path));
        }
        if !self.deduplicate {
            return Ok(MediaPlacement::NeedsDownload {
                download_to: chat_path.clone(),
                chat: chat_path,
                via_shared: false,
            });
        }
        let shared_dir = self.shared_dir();
        tokio::fs::create_dir_all(&shared_dir).await?;
        let shared_path = shared_dir.join(file_name);
        if tokio::fs::try_exists(&shared_path).await.unwrap_or(false) {
            return Ok(MediaPlacement::NeedsLink {
                shared: shared_path,
                chat: chat_path,
            });
        }
        Ok(MediaPlacement::NeedsDownload {
            download_to: shared_path,
            chat: chat_path,
            via_shared: true,
        })
    }

    /// Materialise the chat-scoped reference after the transfer (or for a
    /// dedup hit). Returns the path to record and the on-disk size.
    pub async fn finalize(&self, placement: &MediaPlacement) -> io::Result<(PathBuf, u64)> {
        let chat_path = match placement {
            MediaPlacement::Existing(path) => path.clone(),
            MediaPlacement::NeedsLink { shared, chat } => {
                self.reference_pool_file(shared, chat, false).await?
            }
            MediaPlacement::NeedsDownload {
                download_to,
                chat,
                via_shared,
            } => {
                if *via_shared {
                    self.reference_pool_file(download_to, chat, true).await?
                } else {
                    chat.clone()
                }
            }
        };
        // Follow the link when measuring; the pool holds the bytes.
        let size = tokio::fs::metadata(&chat_path).await?.len();
        Ok((chat_path, size))
    }

    /// Create a relative symlink `chat -> shared`. When symlinks are not
    /// available, fall back to copying the bytes (dedup hit) or moving the
    /// fresh pool copy into the chat directory.
    async fn reference_pool_file(
        &self,
        shared: &Path,
        chat: &Path,
        move_on_failure: bool,
    ) -> io::Result<PathBuf> {
        let target = relative_to(shared, chat.parent().unwrap_or(Path::new(".")));
        match symlink(&target, chat) {
            Ok(()) => {
                debug!(file = %chat.display(), "linked into dedup pool");
                Ok(chat.to_path_buf())
            }
            Err(e) => {
                if move_on_failure {
                    warn!(error = %e, "symlink failed, moving pool copy into chat directory");
                    tokio::fs::rename(shared, chat).await?;
                } else {
                    warn!(error = %e, "symlink failed, copying bytes instead");
                    tokio::fs::copy(shared, chat).await?;
                }
                Ok(chat.to_path_buf())
            }
        }
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks not supported on this platform",
    ))
}

fn relative_to(target: &Path, base: &Path) -> PathBuf {
    pathdiff(target, base).unwrap_or_else(|| target.to_path_buf())
}

/// Minimal relative-path computation: walk up from `base` until a common
/// ancestor, then down to `target`.
fn pathdiff(target: &Path, base: &Path) -> Option<PathBuf> {
    let target: Vec<_> = target.components().collect();
    let base: Vec<_> = base.components().collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for comp in &target[common..] {
        out.push(comp);
    }
    Some(out)
}

/// Stable media row id.
pub fn media_id(chat_id: i64, message_id: i64, kind: MediaKind) -> String {
    format!("{chat_id}_{message_id}_{}", kind.as_str())
}

/// Filename policy: `<file_id>.<ext>`, or `<file_id>_<original_name>` when a
/// document carries its own name. The extension comes from the MIME type
/// first, the media type as fallback.
pub fn media_file_name(
    file_id: i64,
    original_name: Option<&str>,
    mime_type: Option<&str>,
    kind: MediaKind,
) -> String {
    let safe_id = sanitize(&file_id.to_string());
    if let Some(name) = original_name.filter(|n| !n.is_empty()) {
        return format!("{safe_id}_{}", sanitize(name));
    }
    let extension = mime_type
        .and_then(extension_for_mime)
        .unwrap_or_else(|| extension_for_kind(kind));
    format!("{safe_id}.{extension}")
}

fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

fn extension_for_mime(mime: &str) -> Option<String> {
    let ext = mime_guess::get_mime_extensions_str(mime)?.first()?;
    // mime_guess prefers "jpe" for image/jpeg.
    Some(if *ext == "jpe" { "jpg".into() } else { (*ext).to_string() })
}

fn extension_for_kind(kind: MediaKind) -> String {
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Audio => "mp3",
        MediaKind::Voice => "ogg",
        MediaKind::Animation => "mp4",
        MediaKind::Sticker => "webp",
        _ => "bin",
    }
    .to_string()
}

/// Check a media row's file: present, non-empty, and within 1 % of the
/// recorded size when one is known.
pub fn check_file(path: &Path, expected_size: Option<i64>) -> FileCheck {
    let Ok(meta) = std::fs::metadata(path) else {
        return FileCheck::Missing;
    };
    let actual = meta.len();
    if actual == 0 {
        return FileCheck::Empty;
    }
    if let Some(expected) = expected_size.filter(|s| *s > 0) {
        let expected = expected as f64;
        if (actual as f64 - expected).abs() > expected * 0.01 {
            return FileCheck::SizeMismatch;
        }
    }
    FileCheck::Ok
}

/// Remove a chat's on-disk footprint: its media directory and its avatar
/// files. Failures are logged, never raised; row deletion already happened.
pub async fn remove_chat_files(media_root: &Path, chat_id: i64) {
    let chat_dir = media_root.join(chat_id.to_string());
    match tokio::fs::remove_dir_all(&chat_dir).await {
        Ok(()) => info!(dir = %chat_dir.display(), "removed chat media directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %chat_dir.display(), error = %e, "failed to remove chat media directory"),
    }
    for folder in ["chats", "users"] {
        let dir = media_root.join("avatars").join(folder);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let prefix = format!("{chat_id}_");
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".jpg") {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => info!(file = %entry.path().display(), "removed avatar file"),
                    Err(e) => warn!(file = %entry.path().display(), error = %e, "failed to remove avatar"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_uses_mime_extension_first() {
        assert_eq!(
            media_file_name(123456, None, Some("image/jpeg"), MediaKind::Document),
            "123456.jpg"
        );
        // MIME unknown: the media type decides.
        assert_eq!(
            media_file_name(123456, None, Some("application/x-unknown-thing"), MediaKind::Video),
            "123456.mp4"
        );
        assert_eq!(media_file_name(7, None, None, MediaKind::Voice), "7.ogg");
    }

    #[test]
    fn filename_keeps_original_document_name() {
        assert_eq!(
            media_file_name(9, Some("report.pdf"), Some("application/pdf"), MediaKind::Document),
            "9_report.pdf"
        );
        // Separators in the original name cannot escape the directory.
        assert_eq!(
            media_file_name(9, Some("a/b\\c.txt"), None, MediaKind::Document),
            "9_a_b_c.txt"
        );
    }

    #[test]
    fn media_id_is_chat_message_type() {
        assert_eq!(media_id(-100123, 45, MediaKind::Photo), "-100123_45_photo");
    }

    #[test]
    fn check_file_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        assert_eq!(check_file(&path, Some(100)), FileCheck::Missing);

        std::fs::write(&path, b"").unwrap();
        assert_eq!(check_file(&path, Some(100)), FileCheck::Empty);

        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        assert_eq!(check_file(&path, Some(1000)), FileCheck::Ok);
        // Within 1 % tolerance.
        assert_eq!(check_file(&path, Some(995)), FileCheck::Ok);
        assert_eq!(check_file(&path, Some(900)), FileCheck::SizeMismatch);
        // No recorded size: presence is enough.
        assert_eq!(check_file(&path, None), FileCheck::Ok);
    }

    #[tokio::test]
    async fn dedup_flow_links_second_chat_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), true);

        // First sighting downloads into the pool.
        let plan = store.plan(-42, "abc.jpg").await.unwrap();
        let MediaPlacement::NeedsDownload { download_to, via_shared: true, .. } = plan.clone()
        else {
            panic!("expected pool download, got {plan:?}");
        };
        std::fs::write(&download_to, b"image-bytes").unwrap();
        let (path, size) = store.finalize(&plan).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(path, store.chat_dir(-42).join("abc.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");

        // Second chat reuses the pool copy without another transfer.
        let plan = store.plan(-43, "abc.jpg").await.unwrap();
        assert!(matches!(plan, MediaPlacement::NeedsLink { .. }));
        let (path, _) = store.finalize(&plan).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");

        // Re-planning the first chat is a no-op.
        let plan = store.plan(-42, "abc.jpg").await.unwrap();
        assert!(matches!(plan, MediaPlacement::Existing(_)));
    }

    #[tokio::test]
    async fn non_dedup_downloads_straight_into_chat_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), false);
        let plan = store.plan(-42, "abc.jpg").await.unwrap();
        let MediaPlacement::NeedsDownload { download_to, via_shared, .. } = &plan else {
            panic!("expected download");
        };
        assert!(!via_shared);
        assert_eq!(*download_to, store.chat_dir(-42).join("abc.jpg"));
    }

    #[test]
    fn avatar_resolution_prefers_newest_and_accepts_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), true);
        let avatars = store.avatar_dir(ChatKind::Group);
        std::fs::create_dir_all(&avatars).unwrap();

        let legacy = avatars.join("-42.jpg");
        std::fs::write(&legacy, b"old").unwrap();
        assert_eq!(
            store.find_current_avatar(ChatKind::Group, -42),
            Some(legacy.clone())
        );

        let newer = avatars.join("-42_999.jpg");
        std::fs::write(&newer, b"new").unwrap();
        let old_time = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&legacy)
            .unwrap()
            .set_modified(old_time)
            .unwrap();
        assert_eq!(store.find_current_avatar(ChatKind::Group, -42), Some(newer));

        // Other chats' avatars never match.
        assert_eq!(store.find_current_avatar(ChatKind::Group, -429), None);
    }

    #[tokio::test]
    async fn remove_chat_files_sweeps_dir_and_avatars() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), true);
        let chat_dir = store.chat_dir(-42);
        std::fs::create_dir_all(&chat_dir).unwrap();
        std::fs::write(chat_dir.join("f.jpg"), b"x").unwrap();
        let avatars = store.avatar_dir(ChatKind::Group);
        std::fs::create_dir_all(&avatars).unwrap();
        std::fs::write(avatars.join("-42_1.jpg"), b"a").unwrap();
        std::fs::write(avatars.join("-43_1.jpg"), b"b").unwrap();

        remove_chat_files(dir.path(), -42).await;

        assert!(!chat_dir.exists());
        assert!(!avatars.join("-42_1.jpg").exists());
        assert!(avatars.join("-43_1.jpg").exists());
    }
}
