use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name given to conversations created without one.
pub const DEFAULT_CONVERSATION_NAME: &str = "Name me 😘";

/// A named chat room with a fixed owner and lock/visibility flags.
///
/// `member_ids` is kept in join order. `owner_id` is recorded explicitly at
/// creation time instead of being re-derived from the first member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub member_ids: Vec<String>,
    pub is_locked: bool,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.iter().any(|id| id == user_id)
    }
}

/// Per-(conversation, user) display overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: String,
    pub user_id: String,
    pub pseudo: Option<String>,
    pub smiley: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(conversation_id: &str, user_id: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            pseudo: None,
            smiley: None,
            joined_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct React {
    pub emoji: String,
    pub issuer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

impl MediaKind {
    /// Classify an upload by its MIME type. Returns `None` for anything that
    /// is not an image, audio or video payload.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.starts_with("image/") {
            Some(Self::Image)
        } else if essence.starts_with("audio/") {
            Some(Self::Audio)
        } else if essence.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// An uploaded blob referenced from a message. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub id: String,
    pub conversation_id: String,
    pub issuer_id: String,
    pub kind: MediaKind,
    /// Opaque storage reference understood by the media store.
    pub key: String,
    pub size: u64,
    pub sha256: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub issuer_id: String,
    pub content: String,
    pub medias: Vec<MediaAttachment>,
    pub reacts: Vec<React>,
    /// voter id -> votee id. One active vote per voter.
    pub votes: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn has_react(&self, issuer_id: &str, emoji: &str) -> bool {
        self.reacts
            .iter()
            .any(|r| r.issuer_id == issuer_id && r.emoji == emoji)
    }
}

/// Point-in-time authoritative view of a conversation, used by clients to
/// seed their local state before applying live events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub memberships: Vec<Membership>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAnalysis {
    pub summary: String,
    pub emoji: String,
}

/// End-of-night analysis produced once per lock transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub per_user: BTreeMap<String, UserAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisState {
    /// `previous` keeps the last ready analysis readable while a relock
    /// generates a new one.
    Pending {
        requested_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<Analysis>,
    },
    Ready { analysis: Analysis, generated_at: DateTime<Utc> },
    Failed { reason: String },
}
