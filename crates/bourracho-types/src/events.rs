use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Membership, Message};

/// State changes broadcast to every subscriber of a conversation.
///
/// Every variant carries a full snapshot of the affected entity, never a
/// diff, so applying the same event twice yields the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    MessagePosted {
        conversation_id: String,
        changed_by: String,
        message: Message,
    },

    /// A reaction was toggled on or off.
    ReactionChanged {
        conversation_id: String,
        changed_by: String,
        message: Message,
    },

    VoteChanged {
        conversation_id: String,
        changed_by: String,
        message: Message,
    },

    ConversationRenamed {
        conversation_id: String,
        changed_by: String,
        conversation: Conversation,
    },

    LockChanged {
        conversation_id: String,
        changed_by: String,
        conversation: Conversation,
    },

    VisibilityChanged {
        conversation_id: String,
        changed_by: String,
        conversation: Conversation,
    },

    /// Pseudo or smiley changed. Cleared values are serialized as `null`.
    MembershipDataChanged {
        conversation_id: String,
        changed_by: String,
        membership: Membership,
    },

    UserJoined {
        conversation_id: String,
        changed_by: String,
        conversation: Conversation,
        membership: Membership,
    },

    /// A member left. The snapshot reflects any ownership handover.
    UserLeft {
        conversation_id: String,
        changed_by: String,
        conversation: Conversation,
    },
}

impl DomainEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::MessagePosted { conversation_id, .. }
            | Self::ReactionChanged { conversation_id, .. }
            | Self::VoteChanged { conversation_id, .. }
            | Self::ConversationRenamed { conversation_id, .. }
            | Self::LockChanged { conversation_id, .. }
            | Self::VisibilityChanged { conversation_id, .. }
            | Self::MembershipDataChanged { conversation_id, .. }
            | Self::UserJoined { conversation_id, .. }
            | Self::UserLeft { conversation_id, .. } => conversation_id,
        }
    }

    pub fn changed_by(&self) -> &str {
        match self {
            Self::MessagePosted { changed_by, .. }
            | Self::ReactionChanged { changed_by, .. }
            | Self::VoteChanged { changed_by, .. }
            | Self::ConversationRenamed { changed_by, .. }
            | Self::LockChanged { changed_by, .. }
            | Self::VisibilityChanged { changed_by, .. }
            | Self::MembershipDataChanged { changed_by, .. }
            | Self::UserJoined { changed_by, .. }
            | Self::UserLeft { changed_by, .. } => changed_by,
        }
    }

    /// The wire `type` tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessagePosted { .. } => "MessagePosted",
            Self::ReactionChanged { .. } => "ReactionChanged",
            Self::VoteChanged { .. } => "VoteChanged",
            Self::ConversationRenamed { .. } => "ConversationRenamed",
            Self::LockChanged { .. } => "LockChanged",
            Self::VisibilityChanged { .. } => "VisibilityChanged",
            Self::MembershipDataChanged { .. } => "MembershipDataChanged",
            Self::UserJoined { .. } => "UserJoined",
            Self::UserLeft { .. } => "UserLeft",
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    PostMessage {
        content: String,
        #[serde(default)]
        media_ids: Vec<String>,
    },

    React { message_id: String, emoji: String },

    Vote { message_id: String, votee_id: String },
}

/// Connection-scoped frames sent FROM server TO a single client. Domain
/// events are sent as-is; these only concern the receiving connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayReply {
    /// Subscription established; events for `conversation_id` follow.
    Ready {
        conversation_id: String,
        user_id: String,
    },

    /// A command sent over this connection was refused.
    CommandRejected { code: String, error: String },
}
