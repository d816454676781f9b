//! Database row types. These map directly to SQLite rows and are converted
//! into the `bourracho-types` models at the query boundary.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};

use bourracho_types::models::{Conversation, MediaAttachment, MediaKind, Membership, Message};

/// Timestamps are stored as fixed-width RFC 3339 with nanoseconds so that
/// lexical order in SQLite matches chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}

pub struct ConversationRow {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub is_locked: bool,
    pub is_visible: bool,
    pub created_at: String,
}

impl ConversationRow {
    pub fn into_model(self, member_ids: Vec<String>) -> Result<Conversation> {
        Ok(Conversation {
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
            member_ids,
            is_locked: self.is_locked,
            is_visible: self.is_visible,
        })
    }
}

pub struct MembershipRow {
    pub conversation_id: String,
    pub user_id: String,
    pub pseudo: Option<String>,
    pub smiley: Option<String>,
    pub joined_at: String,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = anyhow::Error;

    fn try_from(row: MembershipRow) -> Result<Self> {
        Ok(Membership {
            joined_at: parse_ts(&row.joined_at)?,
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            pseudo: row.pseudo,
            smiley: row.smiley,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub issuer_id: String,
    pub content: String,
    pub medias: String,
    pub reacts: String,
    pub votes: String,
    pub timestamp: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let medias = serde_json::from_str(&row.medias)
            .with_context(|| format!("corrupt medias on message '{}'", row.id))?;
        let reacts = serde_json::from_str(&row.reacts)
            .with_context(|| format!("corrupt reacts on message '{}'", row.id))?;
        let votes = serde_json::from_str(&row.votes)
            .with_context(|| format!("corrupt votes on message '{}'", row.id))?;
        Ok(Message {
            timestamp: parse_ts(&row.timestamp)?,
            id: row.id,
            conversation_id: row.conversation_id,
            issuer_id: row.issuer_id,
            content: row.content,
            medias,
            reacts,
            votes,
        })
    }
}

pub struct MediaRow {
    pub id: String,
    pub conversation_id: String,
    pub issuer_id: String,
    pub kind: String,
    pub storage_key: String,
    pub size: i64,
    pub sha256: String,
    pub url: String,
    pub timestamp: String,
}

impl TryFrom<MediaRow> for MediaAttachment {
    type Error = anyhow::Error;

    fn try_from(row: MediaRow) -> Result<Self> {
        let kind = MediaKind::parse(&row.kind)
            .ok_or_else(|| anyhow!("unknown media kind '{}' on media '{}'", row.kind, row.id))?;
        Ok(MediaAttachment {
            timestamp: parse_ts(&row.timestamp)?,
            size: u64::try_from(row.size)?,
            id: row.id,
            conversation_id: row.conversation_id,
            issuer_id: row.issuer_id,
            kind,
            key: row.storage_key,
            sha256: row.sha256,
            url: row.url,
        })
    }
}
