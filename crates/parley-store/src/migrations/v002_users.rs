use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Sender profiles cached for group conversations
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    avatar_path  TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(conversation_id, sender_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
