use crate::models::{ConversationRow, MediaRow, MembershipRow, MessageRow, format_ts};
use crate::{Database, EntityStore};
use anyhow::{Context, Result};
use rusqlite::{Connection, Row};

use bourracho_types::models::{AnalysisState, Conversation, MediaAttachment, Membership, Message};

const CONVERSATION_COLUMNS: &str = "id, name, owner_id, is_locked, is_visible, created_at";
const MEMBERSHIP_COLUMNS: &str = "conversation_id, user_id, pseudo, smiley, joined_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, issuer_id, content, medias, reacts, votes, timestamp";
const MEDIA_COLUMNS: &str =
    "id, conversation_id, issuer_id, kind, storage_key, size, sha256, url, timestamp";

impl EntityStore for Database {
    // -- Conversations --

    fn insert_conversation(&self, conversation: &Conversation, owner: &Membership) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, name, owner_id, is_locked, is_visible, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    conversation.id,
                    conversation.name,
                    conversation.owner_id,
                    conversation.is_locked,
                    conversation.is_visible,
                    format_ts(&conversation.created_at),
                ],
            )?;
            insert_membership_row(&tx, owner)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE id IN (SELECT conversation_id FROM memberships WHERE user_id = ?1)
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map([user_id], conversation_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|row| {
                    let members = query_member_ids(conn, &row.id)?;
                    row.into_model(members)
                })
                .collect()
        })
    }

    fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.with_conn(|conn| update_conversation_row(conn, conversation))
    }

    fn update_conversation_and_analysis(
        &self,
        conversation: &Conversation,
        analysis: &AnalysisState,
    ) -> Result<()> {
        let state = serde_json::to_string(analysis)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            update_conversation_row(&tx, conversation)?;
            save_analysis_row(&tx, &conversation.id, &state)?;
            tx.commit()?;
            Ok(())
        })
    }

    // -- Memberships --

    fn insert_membership(&self, membership: &Membership) -> Result<()> {
        self.with_conn(|conn| insert_membership_row(conn, membership))
    }

    fn update_membership(&self, membership: &Membership) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memberships SET pseudo = ?3, smiley = ?4
                 WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![
                    membership.conversation_id,
                    membership.user_id,
                    membership.pseudo,
                    membership.smiley,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_member(&self, conversation: &Conversation, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM memberships WHERE conversation_id = ?1 AND user_id = ?2",
                [conversation.id.as_str(), user_id],
            )?;
            if removed == 0 {
                anyhow::bail!("user {} is not a member of {}", user_id, conversation.id);
            }
            update_conversation_row(&tx, conversation)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_membership(&self, conversation_id: &str, user_id: &str) -> Result<Option<Membership>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
                         WHERE conversation_id = ?1 AND user_id = ?2"
                    ),
                    [conversation_id, user_id],
                    membership_row,
                )
                .optional()?;
            row.map(Membership::try_from).transpose()
        })
    }

    fn list_memberships(&self, conversation_id: &str) -> Result<Vec<Membership>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
                 WHERE conversation_id = ?1 ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map([conversation_id], membership_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Membership::try_from).collect()
        })
    }

    // -- Messages --

    fn insert_message(&self, message: &Message) -> Result<()> {
        let medias = serde_json::to_string(&message.medias)?;
        let reacts = serde_json::to_string(&message.reacts)?;
        let votes = serde_json::to_string(&message.votes)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, issuer_id, content, medias, reacts, votes, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id,
                    message.conversation_id,
                    message.issuer_id,
                    message.content,
                    medias,
                    reacts,
                    votes,
                    format_ts(&message.timestamp),
                ],
            )?;
            for media in &message.medias {
                tx.execute(
                    "UPDATE medias SET message_id = ?2 WHERE id = ?1",
                    [&media.id, &message.id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    message_row,
                )
                .optional()?;
            row.map(Message::try_from).transpose()
        })
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let reacts = serde_json::to_string(&message.reacts)?;
        let votes = serde_json::to_string(&message.votes)?;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET reacts = ?2, votes = ?3 WHERE id = ?1",
                rusqlite::params![message.id, reacts, votes],
            )?;
            Ok(())
        })
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY timestamp, id"
            ))?;
            let rows = stmt
                .query_map([conversation_id], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Message::try_from).collect()
        })
    }

    // -- Media --

    fn insert_media(&self, media: &MediaAttachment) -> Result<()> {
        let size = i64::try_from(media.size).context("media size out of range")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO medias (id, conversation_id, issuer_id, kind, storage_key, size, sha256, url, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    media.id,
                    media.conversation_id,
                    media.issuer_id,
                    media.kind.as_str(),
                    media.key,
                    size,
                    media.sha256,
                    media.url,
                    format_ts(&media.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    fn get_media(&self, id: &str) -> Result<Option<MediaAttachment>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MEDIA_COLUMNS} FROM medias WHERE id = ?1"),
                    [id],
                    media_row,
                )
                .optional()?;
            row.map(MediaAttachment::try_from).transpose()
        })
    }

    fn is_media_attached(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let attached: Option<Option<String>> = conn
                .query_row("SELECT message_id FROM medias WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(matches!(attached, Some(Some(_))))
        })
    }

    // -- Analyses --

    fn save_analysis(&self, conversation_id: &str, state: &AnalysisState) -> Result<()> {
        let state = serde_json::to_string(state)?;
        self.with_conn(|conn| save_analysis_row(conn, conversation_id, &state))
    }

    fn get_analysis(&self, conversation_id: &str) -> Result<Option<AnalysisState>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state FROM analyses WHERE conversation_id = ?1",
                    [conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt analysis for '{}'", conversation_id))
            })
            .transpose()
        })
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

fn update_conversation_row(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET name = ?2, owner_id = ?3, is_locked = ?4, is_visible = ?5
         WHERE id = ?1",
        rusqlite::params![
            conversation.id,
            conversation.name,
            conversation.owner_id,
            conversation.is_locked,
            conversation.is_visible,
        ],
    )?;
    Ok(())
}

fn save_analysis_row(conn: &Connection, conversation_id: &str, state: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO analyses (conversation_id, state) VALUES (?1, ?2)
         ON CONFLICT(conversation_id) DO UPDATE SET
            state = excluded.state,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        rusqlite::params![conversation_id, state],
    )?;
    Ok(())
}

fn insert_membership_row(conn: &Connection, membership: &Membership) -> Result<()> {
    conn.execute(
        "INSERT INTO memberships (conversation_id, user_id, pseudo, smiley, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            membership.conversation_id,
            membership.user_id,
            membership.pseudo,
            membership.smiley,
            format_ts(&membership.joined_at),
        ],
    )?;
    Ok(())
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            [id],
            conversation_row,
        )
        .optional()?;

    match row {
        Some(row) => {
            let members = query_member_ids(conn, &row.id)?;
            Ok(Some(row.into_model(members)?))
        }
        None => Ok(None),
    }
}

fn query_member_ids(conn: &Connection, conversation_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM memberships WHERE conversation_id = ?1 ORDER BY seq")?;
    let ids = stmt
        .query_map([conversation_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        is_locked: row.get(3)?,
        is_visible: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn membership_row(row: &Row<'_>) -> rusqlite::Result<MembershipRow> {
    Ok(MembershipRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        pseudo: row.get(2)?,
        smiley: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        issuer_id: row.get(2)?,
        content: row.get(3)?,
        medias: row.get(4)?,
        reacts: row.get(5)?,
        votes: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

fn media_row(row: &Row<'_>) -> rusqlite::Result<MediaRow> {
    Ok(MediaRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        issuer_id: row.get(2)?,
        kind: row.get(3)?,
        storage_key: row.get(4)?,
        size: row.get(5)?,
        sha256: row.get(6)?,
        url: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
