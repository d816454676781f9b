use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            owner_id    TEXT NOT NULL,
            is_locked   INTEGER NOT NULL DEFAULT 0,
            is_visible  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        -- seq preserves join order; the owner is recorded on the conversation
        CREATE TABLE IF NOT EXISTS memberships (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL,
            pseudo          TEXT,
            smiley          TEXT,
            joined_at       TEXT NOT NULL,
            UNIQUE(conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_user
            ON memberships(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            issuer_id       TEXT NOT NULL,
            content         TEXT NOT NULL,
            medias          TEXT NOT NULL DEFAULT '[]',
            reacts          TEXT NOT NULL DEFAULT '[]',
            votes           TEXT NOT NULL DEFAULT '{}',
            timestamp       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp, id);

        CREATE TABLE IF NOT EXISTS medias (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            issuer_id       TEXT NOT NULL,
            kind            TEXT NOT NULL,
            storage_key     TEXT NOT NULL,
            size            INTEGER NOT NULL,
            sha256          TEXT NOT NULL,
            url             TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            message_id      TEXT REFERENCES messages(id)
        );

        CREATE TABLE IF NOT EXISTS analyses (
            conversation_id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
            state           TEXT NOT NULL,
            updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
