/// SQL DDL for the haven-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    platform_ref TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS key_records (
    user_id TEXT PRIMARY KEY REFERENCES users(id),
    salt TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    rotated_at TEXT
);

CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    platform_ref TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id),
    state TEXT NOT NULL DEFAULT 'active',
    started_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    idled_at TEXT,
    closed_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    last_user_activity TEXT,
    last_bot_activity TEXT
);

CREATE TABLE IF NOT EXISTS updates (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id),
    platform_id TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    supersedes TEXT,
    payload TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_entries (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    ordinal INTEGER NOT NULL,
    ordinal_end INTEGER NOT NULL,
    kind TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    plaintext_len INTEGER NOT NULL,
    key_version INTEGER NOT NULL,
    superseded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- At most one non-closed session per chat.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_chat_open
    ON sessions(chat_id) WHERE state != 'closed';

-- Dedup identity is enforced here, not in memory: concurrent ingestion
-- paths cannot double-insert the same logical event.
CREATE UNIQUE INDEX IF NOT EXISTS idx_updates_chat_dedup
    ON updates(chat_id, dedup_key);

-- The current-context view has unique, contiguous ordinals; the
-- superseded tier underneath keeps the audit trail.
CREATE UNIQUE INDEX IF NOT EXISTS idx_context_current_ordinal
    ON context_entries(chat_id, ordinal) WHERE superseded = 0;

CREATE INDEX IF NOT EXISTS idx_sessions_chat ON sessions(chat_id);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
CREATE INDEX IF NOT EXISTS idx_updates_chat_platform ON updates(chat_id, platform_id);
CREATE INDEX IF NOT EXISTS idx_context_chat_ordinal ON context_entries(chat_id, ordinal);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
