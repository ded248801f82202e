//! v001 -- Initial schema creation.
//!
//! Creates the `conversations` and `messages` tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,
    name              TEXT,
    is_group          INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    recent_message_id TEXT,                         -- weak ref, may dangle
    message_count     INTEGER NOT NULL DEFAULT 0,
    participants      TEXT NOT NULL DEFAULT '[]'    -- JSON array of participants
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- No foreign key to conversations: listener events may deliver messages
-- before the conversation record is cached locally.
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    timestamp_ms    INTEGER NOT NULL,               -- Unix epoch millis, UTC
    body            TEXT NOT NULL DEFAULT '',
    kind            TEXT NOT NULL,
    media_path      TEXT,
    seen_status     INTEGER NOT NULL DEFAULT 0,     -- private conversations
    seen_by         TEXT,                           -- JSON array, group conversations only
    replied_to_id   TEXT,                           -- weak ref, may dangle
    reactions       TEXT NOT NULL DEFAULT '{}',     -- JSON object emoji -> [user]
    edited          INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp_ms, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
