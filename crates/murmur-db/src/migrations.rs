use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                email       TEXT NOT NULL UNIQUE,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                online      INTEGER NOT NULL DEFAULT 0,
                last_seen   TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id              TEXT PRIMARY KEY,
                is_group        INTEGER NOT NULL DEFAULT 0,
                -- sorted participant pair, only set for direct conversations
                direct_key      TEXT UNIQUE,
                created_by      TEXT NOT NULL REFERENCES users(id),
                created_at      TEXT NOT NULL,
                last_activity   TEXT NOT NULL
            );

            CREATE TABLE memberships (
                user_id         TEXT NOT NULL REFERENCES users(id),
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role            TEXT NOT NULL DEFAULT 'member',
                last_read_seq   INTEGER NOT NULL DEFAULT 0,
                joined_at       TEXT NOT NULL,
                PRIMARY KEY (user_id, conversation_id)
            );

            CREATE INDEX idx_memberships_conversation
                ON memberships(conversation_id);

            CREATE TABLE messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL DEFAULT '',
                attachment_url  TEXT,
                attachment_name TEXT,
                attachment_size INTEGER,
                attachment_mime TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, seq);

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE receipts (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                kind        TEXT NOT NULL CHECK (kind IN ('delivered', 'read')),
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (message_id, user_id, kind)
            );

            INSERT INTO schema_version (version) VALUES (1);
            "
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
