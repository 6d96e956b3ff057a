//! v001 -- Initial schema creation.
//!
//! Creates the `messages` log and the `users` directory.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (append-only, ordered per conversation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- sorted "a_b" participant pair
    sender_id       TEXT NOT NULL,
    receiver_id     TEXT NOT NULL,
    text            TEXT NOT NULL,
    attachment      TEXT,                       -- opaque URI
    created_at      TEXT NOT NULL,              -- RFC-3339
    seq_millis      INTEGER NOT NULL,
    seq_counter     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq_millis, seq_counter);

-- ----------------------------------------------------------------
-- Users seen through the identity provider
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    user_id       TEXT PRIMARY KEY NOT NULL,    -- `sub` claim
    email         TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
