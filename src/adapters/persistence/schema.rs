//! Schema DDL, once per dialect.
//!
//! The logical schema is identical; the dialects differ in integer/serial
//! types and timestamp storage (the embedded store keeps timestamps as
//! text). Statements are idempotent so startup can always run them.

pub const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        id INTEGER PRIMARY KEY,
        type TEXT NOT NULL,
        title TEXT,
        username TEXT,
        first_name TEXT,
        last_name TEXT,
        phone TEXT,
        description TEXT,
        participants_count INTEGER,
        last_synced_message_id INTEGER NOT NULL DEFAULT 0,
        created_at TEXT,
        updated_at TEXT
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT,
        first_name TEXT,
        last_name TEXT,
        phone TEXT,
        is_bot INTEGER NOT NULL DEFAULT 0,
        created_at TEXT,
        updated_at TEXT
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER NOT NULL,
        chat_id INTEGER NOT NULL REFERENCES chats (id),
        sender_id INTEGER,
        date TEXT NOT NULL,
        text TEXT,
        reply_to_msg_id INTEGER,
        reply_to_text TEXT,
        forward_from_id INTEGER,
        edit_date TEXT,
        media_type TEXT,
        media_id TEXT,
        media_path TEXT,
        raw_data TEXT,
        created_at TEXT,
        is_outgoing INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, chat_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages (chat_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_date ON messages (date)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_id ON messages (sender_id)",
    r#"
    CREATE TABLE IF NOT EXISTS media (
        id TEXT PRIMARY KEY,
        message_id INTEGER,
        chat_id INTEGER,
        type TEXT,
        file_path TEXT,
        file_name TEXT,
        file_size INTEGER,
        mime_type TEXT,
        width INTEGER,
        height INTEGER,
        duration INTEGER,
        downloaded INTEGER NOT NULL DEFAULT 0,
        download_date TEXT,
        created_at TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_media_message ON media (message_id, chat_id)",
    r#"
    CREATE TABLE IF NOT EXISTS reactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id INTEGER NOT NULL,
        chat_id INTEGER NOT NULL,
        emoji TEXT NOT NULL,
        user_id INTEGER,
        count INTEGER NOT NULL DEFAULT 1,
        created_at TEXT,
        UNIQUE (message_id, chat_id, emoji, user_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions (message_id, chat_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_status (
        chat_id INTEGER PRIMARY KEY REFERENCES chats (id),
        last_message_id INTEGER NOT NULL DEFAULT 0,
        last_sync_date TEXT,
        message_count INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS push_subscriptions (
        endpoint TEXT PRIMARY KEY,
        p256dh TEXT NOT NULL,
        auth TEXT NOT NULL,
        chat_id INTEGER,
        user_agent TEXT,
        created_at TEXT,
        last_used_at TEXT
    )"#,
];

pub const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        id BIGINT PRIMARY KEY,
        type VARCHAR(50) NOT NULL,
        title VARCHAR(255),
        username VARCHAR(255),
        first_name VARCHAR(255),
        last_name VARCHAR(255),
        phone VARCHAR(50),
        description TEXT,
        participants_count INTEGER,
        last_synced_message_id BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP,
        updated_at TIMESTAMP
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGINT PRIMARY KEY,
        username VARCHAR(255),
        first_name VARCHAR(255),
        last_name VARCHAR(255),
        phone VARCHAR(50),
        is_bot INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP,
        updated_at TIMESTAMP
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id BIGINT NOT NULL,
        chat_id BIGINT NOT NULL REFERENCES chats (id),
        sender_id BIGINT,
        date TIMESTAMP NOT NULL,
        text TEXT,
        reply_to_msg_id BIGINT,
        reply_to_text TEXT,
        forward_from_id BIGINT,
        edit_date TIMESTAMP,
        media_type VARCHAR(50),
        media_id VARCHAR(255),
        media_path VARCHAR(500),
        raw_data TEXT,
        created_at TIMESTAMP,
        is_outgoing INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, chat_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages (chat_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_date ON messages (date)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_id ON messages (sender_id)",
    r#"
    CREATE TABLE IF NOT EXISTS media (
        id VARCHAR(255) PRIMARY KEY,
        message_id BIGINT,
        chat_id BIGINT,
        type VARCHAR(50),
        file_path VARCHAR(500),
        file_name VARCHAR(255),
        file_size BIGINT,
        mime_type VARCHAR(100),
        width INTEGER,
        height INTEGER,
        duration INTEGER,
        downloaded INTEGER NOT NULL DEFAULT 0,
        download_date TIMESTAMP,
        created_at TIMESTAMP
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_media_message ON media (message_id, chat_id)",
    r#"
    CREATE TABLE IF NOT EXISTS reactions (
        id BIGSERIAL PRIMARY KEY,
        message_id BIGINT NOT NULL,
        chat_id BIGINT NOT NULL,
        emoji VARCHAR(50) NOT NULL,
        user_id BIGINT,
        count INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP,
        CONSTRAINT uq_reaction UNIQUE (message_id, chat_id, emoji, user_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions (message_id, chat_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_status (
        chat_id BIGINT PRIMARY KEY REFERENCES chats (id),
        last_message_id BIGINT NOT NULL DEFAULT 0,
        last_sync_date TIMESTAMP,
        message_count INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key VARCHAR(255) PRIMARY KEY,
        value TEXT
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS push_subscriptions (
        endpoint TEXT PRIMARY KEY,
        p256dh TEXT NOT NULL,
        auth TEXT NOT NULL,
        chat_id BIGINT,
        user_agent TEXT,
        created_at TIMESTAMP,
        last_used_at TIMESTAMP
    )"#,
];
