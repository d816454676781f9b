use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Membership};

// -- JWT Claims --

/// Identity claims issued by the authentication service. The core treats
/// `sub` as an opaque user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub name: Option<String>,
    pub is_locked: Option<bool>,
    pub is_visible: Option<bool>,
}

/// Partial update of owner-controlled conversation fields. Each present
/// field is applied as its own command, in the order name, lock, visibility.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConversationRequest {
    pub name: Option<String>,
    pub is_locked: Option<bool>,
    pub is_visible: Option<bool>,
}

/// Absent fields leave the stored value untouched; an empty string clears it.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMembershipRequest {
    pub pseudo: Option<String>,
    pub smiley: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JoinResponse {
    pub conversation: Conversation,
    pub membership: Membership,
    /// False when the user was already a member.
    pub newly_joined: bool,
}

// -- Messages --

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PostMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReactRequest {
    pub emoji: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VoteRequest {
    pub votee_id: String,
}

// -- Errors --

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
