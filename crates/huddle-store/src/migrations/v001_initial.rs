//! v001 -- Initial schema creation.
//!
//! Users, conversations with their participant sets, the event ledger and
//! per-user read markers.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (upserted on every successful authentication)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY NOT NULL,    -- id issued by the identity provider
    username    TEXT NOT NULL,
    name        TEXT,
    avatar      TEXT,
    color       TEXT,
    public_key  TEXT,                         -- opaque, never interpreted
    last_seen   TEXT NOT NULL,                -- RFC-3339
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4, or 'master'
    name        TEXT,
    avatar      TEXT,
    created_by  TEXT,                         -- NULL for the master conversation
    is_public   INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants(user_id);

-- ----------------------------------------------------------------
-- Event ledger (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,  -- creation order
    id              TEXT NOT NULL UNIQUE,               -- UUID v4
    kind            TEXT NOT NULL,                      -- JOIN | LEAVE | MESSAGE
    owner_id        TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    text            TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_conversation_seq
    ON events(conversation_id, seq DESC);

-- ----------------------------------------------------------------
-- Read markers (only ever grow)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS event_reads (
    event_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    read_at   TEXT NOT NULL,

    PRIMARY KEY (event_id, user_id),
    FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_event_reads_user ON event_reads(user_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
