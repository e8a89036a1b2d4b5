//! Application configuration. Loaded once at startup from the environment.
//!
//! Scalar settings come through the config crate's environment source;
//! list-typed variables and legacy aliases are read directly so names match
//! the documented surface exactly. Invalid values raise at startup.

use crate::domain::DomainError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Scalar environment settings picked up by the config crate. Everything is
/// optional here; defaults and parsing happen in [`AppConfig::load`].
#[derive(Debug, Deserialize, Default)]
struct EnvSettings {
    backup_path: Option<String>,
    schedule: Option<String>,
    batch_size: Option<String>,
    max_media_size_mb: Option<String>,
    download_media: Option<String>,
    deduplicate_media: Option<String>,
    verify_media: Option<String>,
    sync_deletions_edits: Option<String>,
    enable_listener: Option<String>,
    db_type: Option<String>,
    database_url: Option<String>,
    database_path: Option<String>,
    database_dir: Option<String>,
    db_path: Option<String>,
    session_name: Option<String>,
    session_dir: Option<String>,
    viewer_username: Option<String>,
    viewer_password: Option<String>,
    viewer_timezone: Option<String>,
    viewer_host: Option<String>,
    viewer_port: Option<String>,
    push_notifications: Option<String>,
    vapid_private_key: Option<String>,
    vapid_public_key: Option<String>,
    vapid_contact: Option<String>,
}

/// Which chat types the backup admits when no include rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTypeFilter {
    Private,
    Groups,
    Channels,
}

/// Web Push operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Off,
    /// In-browser notifications only; no server-side deliveries.
    Basic,
    Full,
}

/// Resolved data-store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelection {
    Sqlite { path: PathBuf },
    Postgres { conn_string: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Telegram credentials (required for backup/listener, not for the viewer)
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub phone: Option<String>,

    pub schedule: String,
    pub backup_path: PathBuf,
    pub download_media: bool,
    pub deduplicate_media: bool,
    pub max_media_size_mb: u64,
    pub batch_size: usize,
    pub verify_media: bool,
    pub sync_deletions_edits: bool,

    pub chat_types: Vec<ChatTypeFilter>,
    pub global_include_ids: HashSet<i64>,
    pub global_exclude_ids: HashSet<i64>,
    pub private_include_ids: HashSet<i64>,
    pub private_exclude_ids: HashSet<i64>,
    pub groups_include_ids: HashSet<i64>,
    pub groups_exclude_ids: HashSet<i64>,
    pub channels_include_ids: HashSet<i64>,
    pub channels_exclude_ids: HashSet<i64>,
    /// Processed first, in input order.
    pub priority_chat_ids: Vec<i64>,
    /// Viewer whitelist; normalised to marked ids at viewer startup.
    pub display_chat_ids: Vec<i64>,

    pub enable_listener: bool,
    pub listen_edits: bool,
    pub listen_deletions: bool,
    pub listen_new_messages: bool,
    pub listen_new_messages_media: bool,
    pub listen_chat_actions: bool,
    pub listen_albums: bool,

    pub mass_operation_threshold: usize,
    pub mass_operation_window_seconds: u64,
    /// Knob of the retired pre-commit buffer design; parsed but inert.
    pub mass_operation_buffer_delay: Option<u64>,

    pub store: StoreSelection,

    pub session_name: String,
    pub session_dir: PathBuf,

    pub viewer_username: Option<String>,
    pub viewer_password: Option<String>,
    pub viewer_timezone: String,
    pub viewer_host: String,
    pub viewer_port: u16,

    pub push_mode: PushMode,
    pub vapid_private_key: Option<String>,
    pub vapid_public_key: Option<String>,
    pub vapid_contact: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, DomainError> {
        dotenv::dotenv().ok();

        let env: EnvSettings = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap_or_default();

        let backup_path = PathBuf::from(
            env.backup_path
                .clone()
                .unwrap_or_else(|| "/data/backups".into()),
        );

        // CHAT_TYPES= (explicitly empty) means whitelist-only mode; an unset
        // variable backs up every type.
        let chat_types = match std::env::var("CHAT_TYPES") {
            Ok(raw) => parse_chat_types(&raw)?,
            Err(_) => vec![
                ChatTypeFilter::Private,
                ChatTypeFilter::Groups,
                ChatTypeFilter::Channels,
            ],
        };

        let store = resolve_store(&env, &backup_path);

        let session_dir = env
            .session_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                backup_path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join("session")
            });

        Ok(Self {
            api_id: env_parse("TELEGRAM_API_ID"),
            api_hash: env_string("TELEGRAM_API_HASH"),
            phone: env_string("TELEGRAM_PHONE"),

            schedule: env.schedule.clone().unwrap_or_else(|| "0 */6 * * *".into()),
            backup_path,
            download_media: parse_bool(env.download_media.as_deref(), true),
            deduplicate_media: parse_bool(env.deduplicate_media.as_deref(), true),
            max_media_size_mb: env.max_media_size_mb.as_deref().and_then(|s| s.parse().ok()).unwrap_or(100),
            batch_size: env.batch_size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(100),
            verify_media: parse_bool(env.verify_media.as_deref(), false),
            sync_deletions_edits: parse_bool(env.sync_deletions_edits.as_deref(), false),

            chat_types,
            global_include_ids: parse_id_set(
                &env_first(&["GLOBAL_INCLUDE_CHAT_IDS", "INCLUDE_CHAT_IDS"]),
            ),
            global_exclude_ids: parse_id_set(
                &env_first(&["GLOBAL_EXCLUDE_CHAT_IDS", "EXCLUDE_CHAT_IDS"]),
            ),
            private_include_ids: parse_id_set(&env_first(&["PRIVATE_INCLUDE_CHAT_IDS"])),
            private_exclude_ids: parse_id_set(&env_first(&["PRIVATE_EXCLUDE_CHAT_IDS"])),
            groups_include_ids: parse_id_set(&env_first(&["GROUPS_INCLUDE_CHAT_IDS"])),
            groups_exclude_ids: parse_id_set(&env_first(&["GROUPS_EXCLUDE_CHAT_IDS"])),
            channels_include_ids: parse_id_set(&env_first(&["CHANNELS_INCLUDE_CHAT_IDS"])),
            channels_exclude_ids: parse_id_set(&env_first(&["CHANNELS_EXCLUDE_CHAT_IDS"])),
            priority_chat_ids: parse_id_list(&env_first(&["PRIORITY_CHAT_IDS"])),
            display_chat_ids: parse_id_list(&env_first(&["DISPLAY_CHAT_IDS"])),

            enable_listener: parse_bool(env.enable_listener.as_deref(), false),
            listen_edits: env_bool("LISTEN_EDITS", true),
            listen_deletions: env_bool("LISTEN_DELETIONS", true),
            listen_new_messages: env_bool("LISTEN_NEW_MESSAGES", true),
            listen_new_messages_media: env_bool("LISTEN_NEW_MESSAGES_MEDIA", true),
            listen_chat_actions: env_bool("LISTEN_CHAT_ACTIONS", true),
            listen_albums: env_bool("LISTEN_ALBUMS", true),

            mass_operation_threshold: env_parse("MASS_OPERATION_THRESHOLD").unwrap_or(10),
            mass_operation_window_seconds: env_parse("MASS_OPERATION_WINDOW_SECONDS").unwrap_or(30),
            mass_operation_buffer_delay: env_parse("MASS_OPERATION_BUFFER_DELAY"),

            store,

            session_name: env.session_name.clone().unwrap_or_else(|| "telegram_backup".into()),
            session_dir,

            viewer_username: env.viewer_username.clone().filter(|s| !s.trim().is_empty()),
            viewer_password: env.viewer_password.clone().filter(|s| !s.trim().is_empty()),
            viewer_timezone: env.viewer_timezone.clone().unwrap_or_else(|| "Europe/Madrid".into()),
            viewer_host: env.viewer_host.clone().unwrap_or_else(|| "localhost".into()),
            viewer_port: env.viewer_port.as_deref().and_then(|s| s.parse().ok()).unwrap_or(8080),

            push_mode: parse_push_mode(env.push_notifications.as_deref())?,
            vapid_private_key: env.vapid_private_key.clone().filter(|s| !s.is_empty()),
            vapid_public_key: env.vapid_public_key.clone().filter(|s| !s.is_empty()),
            vapid_contact: env.vapid_contact.clone().filter(|s| !s.is_empty()),
        })
    }

    /// Root of the on-disk media tree.
    pub fn media_path(&self) -> PathBuf {
        self.backup_path.join("media")
    }

    /// MTProto session file.
    pub fn session_path(&self) -> PathBuf {
        self.session_dir.join(format!("{}.session", self.session_name))
    }

    pub fn max_media_size_bytes(&self) -> u64 {
        self.max_media_size_mb * 1024 * 1024
    }

    /// Webhook target for the embedded-store notification transport.
    pub fn internal_push_url(&self) -> String {
        format!("http://{}:{}/internal/push", self.viewer_host, self.viewer_port)
    }

    /// Ensure Telegram credentials are present for a credentialed operation.
    pub fn validate_credentials(&self) -> Result<(), DomainError> {
        if self.api_id.is_none() || self.api_hash.is_none() || self.phone.is_none() {
            return Err(DomainError::Config(
                "missing Telegram credentials (TELEGRAM_API_ID, TELEGRAM_API_HASH, TELEGRAM_PHONE)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Union of every include list; used to fetch includes missing from the
    /// dialog enumeration and for listener admission.
    pub fn all_include_ids(&self) -> HashSet<i64> {
        let mut ids = self.global_include_ids.clone();
        ids.extend(&self.private_include_ids);
        ids.extend(&self.groups_include_ids);
        ids.extend(&self.channels_include_ids);
        ids
    }

    /// Whether the chat sits on an exclude list (as opposed to merely not
    /// matching any admission rule). Excluded chats are deleted from the
    /// archive.
    pub fn is_explicitly_excluded(
        &self,
        chat_id: i64,
        is_user: bool,
        is_group: bool,
        is_channel: bool,
    ) -> bool {
        self.global_exclude_ids.contains(&chat_id)
            || (is_user && self.private_exclude_ids.contains(&chat_id))
            || (is_group && self.groups_exclude_ids.contains(&chat_id))
            || (is_channel && self.channels_exclude_ids.contains(&chat_id))
    }

    /// The admission ruleset, evaluated top to bottom, first match wins:
    /// global exclude, type exclude, global include, type include, type
    /// filter.
    pub fn should_backup_chat(
        &self,
        chat_id: i64,
        is_user: bool,
        is_group: bool,
        is_channel: bool,
    ) -> bool {
        if self.is_explicitly_excluded(chat_id, is_user, is_group, is_channel) {
            return false;
        }
        if self.global_include_ids.contains(&chat_id) {
            return true;
        }
        if is_user && self.private_include_ids.contains(&chat_id) {
            return true;
        }
        if is_group && self.groups_include_ids.contains(&chat_id) {
            return true;
        }
        if is_channel && self.channels_include_ids.contains(&chat_id) {
            return true;
        }
        (is_user && self.chat_types.contains(&ChatTypeFilter::Private))
            || (is_group && self.chat_types.contains(&ChatTypeFilter::Groups))
            || (is_channel && self.chat_types.contains(&ChatTypeFilter::Channels))
    }
}

fn resolve_store(env: &EnvSettings, backup_path: &Path) -> StoreSelection {
    if let Some(url) = env.database_url.as_deref() {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return StoreSelection::Postgres {
                conn_string: url.to_string(),
            };
        }
        if let Some(path) = url.strip_prefix("sqlite:///") {
            return StoreSelection::Sqlite {
                path: PathBuf::from(path),
            };
        }
    }

    let db_type = env.db_type.as_deref().unwrap_or("sqlite").to_lowercase();
    if db_type == "postgres" || db_type == "postgresql" {
        let host = env_string("POSTGRES_HOST").unwrap_or_else(|| "localhost".into());
        let port = env_string("POSTGRES_PORT").unwrap_or_else(|| "5432".into());
        let user = env_string("POSTGRES_USER").unwrap_or_else(|| "telegram".into());
        let password = env_string("POSTGRES_PASSWORD").unwrap_or_default();
        let dbname = env_string("POSTGRES_DB").unwrap_or_else(|| "telegram_backup".into());
        return StoreSelection::Postgres {
            conn_string: format!(
                "host={host} port={port} user={user} password={password} dbname={dbname}"
            ),
        };
    }

    // SQLite path resolution keeps the historical precedence:
    // DATABASE_PATH, then DATABASE_DIR, then DB_PATH, then BACKUP_PATH.
    let path = env
        .database_path
        .clone()
        .map(PathBuf::from)
        .or_else(|| {
            env.database_dir
                .clone()
                .map(|dir| PathBuf::from(dir).join("telegram_backup.db"))
        })
        .or_else(|| env.db_path.clone().map(PathBuf::from))
        .unwrap_or_else(|| backup_path.join("telegram_backup.db"));
    StoreSelection::Sqlite { path }
}

fn parse_chat_types(raw: &str) -> Result<Vec<ChatTypeFilter>, DomainError> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim().to_lowercase();
        if part.is_empty() {
            continue;
        }
        out.push(match part.as_str() {
            "private" => ChatTypeFilter::Private,
            "groups" => ChatTypeFilter::Groups,
            "channels" => ChatTypeFilter::Channels,
            other => {
                return Err(DomainError::Config(format!(
                    "invalid chat type '{other}' (valid: private, groups, channels)"
                )));
            }
        });
    }
    Ok(out)
}

fn parse_push_mode(raw: Option<&str>) -> Result<PushMode, DomainError> {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        None | Some("") | Some("off") => Ok(PushMode::Off),
        Some("basic") => Ok(PushMode::Basic),
        Some("full") => Ok(PushMode::Full),
        Some(other) => Err(DomainError::Config(format!(
            "invalid PUSH_NOTIFICATIONS value '{other}' (valid: off, basic, full)"
        ))),
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(s) => s.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_id_set(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_first(keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| env_string(key))
        .unwrap_or_default()
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(s) => s.trim().eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// A fully-defaulted config for unit tests across the crate.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    pub fn base_config() -> AppConfig {
        AppConfig {
            api_id: None,
            api_hash: None,
            phone: None,
            schedule: "0 */6 * * *".into(),
            backup_path: PathBuf::from("/tmp/backups"),
            download_media: true,
            deduplicate_media: true,
            max_media_size_mb: 100,
            batch_size: 100,
            verify_media: false,
            sync_deletions_edits: false,
            chat_types: vec![
                ChatTypeFilter::Private,
                ChatTypeFilter::Groups,
                ChatTypeFilter::Channels,
            ],
            global_include_ids: HashSet::new(),
            global_exclude_ids: HashSet::new(),
            private_include_ids: HashSet::new(),
            private_exclude_ids: HashSet::new(),
            groups_include_ids: HashSet::new(),
            groups_exclude_ids: HashSet::new(),
            channels_include_ids: HashSet::new(),
            channels_exclude_ids: HashSet::new(),
            priority_chat_ids: Vec::new(),
            display_chat_ids: Vec::new(),
            enable_listener: false,
            listen_edits: true,
            listen_deletions: true,
            listen_new_messages: true,
            listen_new_messages_media: true,
            listen_chat_actions: true,
            listen_albums: true,
            mass_operation_threshold: 10,
            mass_operation_window_seconds: 30,
            mass_operation_buffer_delay: None,
            store: StoreSelection::Sqlite {
                path: PathBuf::from("/tmp/backups/telegram_backup.db"),
            },
            session_name: "telegram_backup".into(),
            session_dir: PathBuf::from("/tmp/session"),
            viewer_username: None,
            viewer_password: None,
            viewer_timezone: "Europe/Madrid".into(),
            viewer_host: "localhost".into(),
            viewer_port: 8080,
            push_mode: PushMode::Off,
            vapid_private_key: None,
            vapid_public_key: None,
            vapid_contact: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::base_config;
    use super::*;

    #[test]
    fn global_exclude_beats_every_include() {
        let mut cfg = base_config();
        cfg.global_exclude_ids.insert(-100123456789);
        cfg.global_include_ids.insert(-100123456789);
        cfg.channels_include_ids.insert(-100123456789);
        assert!(!cfg.should_backup_chat(-100123456789, false, false, true));
    }

    #[test]
    fn type_exclude_beats_global_include() {
        let mut cfg = base_config();
        cfg.groups_exclude_ids.insert(-42);
        cfg.global_include_ids.insert(-42);
        assert!(!cfg.should_backup_chat(-42, false, true, false));
        // The same id as a channel is not touched by the groups exclude.
        assert!(cfg.should_backup_chat(-42, false, false, true));
    }

    #[test]
    fn include_overrides_type_filter() {
        let mut cfg = base_config();
        cfg.chat_types = vec![ChatTypeFilter::Private];
        assert!(!cfg.should_backup_chat(-100555, false, false, true));
        cfg.channels_include_ids.insert(-100555);
        assert!(cfg.should_backup_chat(-100555, false, false, true));
    }

    #[test]
    fn empty_chat_types_is_whitelist_only() {
        let mut cfg = base_config();
        cfg.chat_types = Vec::new();
        assert!(!cfg.should_backup_chat(1001, true, false, false));
        cfg.global_include_ids.insert(1001);
        assert!(cfg.should_backup_chat(1001, true, false, false));
    }

    #[test]
    fn id_lists_tolerate_spaces_and_junk() {
        let set = parse_id_set(" 1001 , -100987654321,, abc , -5 ");
        assert_eq!(
            set,
            HashSet::from([1001, -100987654321, -5])
        );
        assert!(parse_id_set("").is_empty());
    }

    #[test]
    fn priority_list_preserves_order() {
        assert_eq!(parse_id_list("-3,7,-1"), vec![-3, 7, -1]);
    }

    #[test]
    fn chat_types_reject_unknown_values() {
        assert!(parse_chat_types("private,bots").is_err());
        assert!(parse_chat_types("").unwrap().is_empty());
        assert_eq!(parse_chat_types("groups, channels").unwrap().len(), 2);
    }

    #[test]
    fn push_mode_parsing() {
        assert_eq!(parse_push_mode(None).unwrap(), PushMode::Off);
        assert_eq!(parse_push_mode(Some("full")).unwrap(), PushMode::Full);
        assert!(parse_push_mode(Some("loud")).is_err());
    }

    #[test]
    fn credential_validation_requires_all_three() {
        let mut cfg = base_config();
        assert!(cfg.validate_credentials().is_err());
        cfg.api_id = Some(12345);
        cfg.api_hash = Some("hash".into());
        assert!(cfg.validate_credentials().is_err());
        cfg.phone = Some("+1234567890".into());
        assert!(cfg.validate_credentials().is_ok());
    }
}
