//! Lock and visibility flags.
//!
//! The two flags are independent, so a conversation is always in one of four
//! steady phases. Only the owner may flip either flag; asking for the current
//! value is a no-op rather than an error so retried requests are harmless.
//! The single side effect is Unlocked -> Locked, which schedules analysis.

use bourracho_types::models::Conversation;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    OpenHidden,
    OpenVisible,
    LockedHidden,
    LockedVisible,
}

impl Phase {
    pub fn of(conversation: &Conversation) -> Self {
        match (conversation.is_locked, conversation.is_visible) {
            (false, false) => Self::OpenHidden,
            (false, true) => Self::OpenVisible,
            (true, false) => Self::LockedHidden,
            (true, true) => Self::LockedVisible,
        }
    }

    pub fn is_locked(self) -> bool {
        matches!(self, Self::LockedHidden | Self::LockedVisible)
    }

    pub fn is_visible(self) -> bool {
        matches!(self, Self::OpenVisible | Self::LockedVisible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Lock,
    Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    GenerateAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested value equals the current one. Nothing to persist or emit.
    Unchanged,
    Changed {
        from: Phase,
        to: Phase,
        effect: Option<SideEffect>,
    },
}

pub fn require_owner(conversation: &Conversation, actor: &str) -> SyncResult<()> {
    if conversation.is_owner(actor) {
        Ok(())
    } else {
        Err(SyncError::forbidden(format!(
            "{} is not the owner of {}",
            actor, conversation.id
        )))
    }
}

pub fn require_member(conversation: &Conversation, user_id: &str) -> SyncResult<()> {
    if conversation.is_member(user_id) {
        Ok(())
    } else {
        Err(SyncError::forbidden(format!(
            "{} is not a member of {}",
            user_id, conversation.id
        )))
    }
}

/// Posting and reacting are only allowed while open.
pub fn require_open(conversation: &Conversation) -> SyncResult<()> {
    if Phase::of(conversation).is_locked() {
        Err(SyncError::Locked)
    } else {
        Ok(())
    }
}

/// Voting is only allowed while locked.
pub fn require_locked(conversation: &Conversation) -> SyncResult<()> {
    if Phase::of(conversation).is_locked() {
        Ok(())
    } else {
        Err(SyncError::NotLocked)
    }
}

/// Validate and compute a flag change. Returns the updated conversation
/// (identical to the input when unchanged) and the transition taken.
pub fn set_flag(
    conversation: &Conversation,
    actor: &str,
    flag: Flag,
    value: bool,
) -> SyncResult<(Conversation, Transition)> {
    require_owner(conversation, actor)?;

    let from = Phase::of(conversation);
    let current = match flag {
        Flag::Lock => conversation.is_locked,
        Flag::Visibility => conversation.is_visible,
    };
    if current == value {
        return Ok((conversation.clone(), Transition::Unchanged));
    }

    let mut next = conversation.clone();
    match flag {
        Flag::Lock => next.is_locked = value,
        Flag::Visibility => next.is_visible = value,
    }
    let to = Phase::of(&next);

    let effect = (!from.is_locked() && to.is_locked()).then_some(SideEffect::GenerateAnalysis);
    Ok((next, Transition::Changed { from, to, effect }))
}
