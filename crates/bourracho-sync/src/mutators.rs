//! Pure command application.
//!
//! Each mutator takes the current aggregate, the acting user and the command
//! payload, and returns either the next state plus the event to broadcast or
//! a rejection. Ids and timestamps are passed in so the functions stay
//! deterministic; persistence and fan-out belong to the engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use bourracho_types::events::DomainEvent;
use bourracho_types::models::{
    Conversation, DEFAULT_CONVERSATION_NAME, MediaAttachment, Membership, Message, React,
};

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{self, Flag, SideEffect, Transition};

/// Result of a successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<T> {
    pub state: T,
    /// `None` when the command was a no-op.
    pub event: Option<DomainEvent>,
    pub effect: Option<SideEffect>,
}

impl<T> Mutation<T> {
    fn emit(state: T, event: DomainEvent) -> Self {
        Self {
            state,
            event: Some(event),
            effect: None,
        }
    }

    fn silent(state: T) -> Self {
        Self {
            state,
            event: None,
            effect: None,
        }
    }
}

/// Message content and already-uploaded media.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub content: String,
    pub medias: Vec<MediaAttachment>,
}

/// A newly created conversation and its owner's membership.
pub fn create_conversation(
    id: String,
    creator: &str,
    name: Option<&str>,
    is_locked: bool,
    is_visible: bool,
    now: DateTime<Utc>,
) -> (Conversation, Membership) {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_CONVERSATION_NAME)
        .to_string();
    let owner = Membership::new(&id, creator, now);
    let conversation = Conversation {
        id,
        name,
        owner_id: creator.to_string(),
        member_ids: vec![creator.to_string()],
        is_locked,
        is_visible,
        created_at: now,
    };
    (conversation, owner)
}

pub fn post_message(
    conversation: &Conversation,
    issuer: &str,
    draft: MessageDraft,
    id: String,
    now: DateTime<Utc>,
) -> SyncResult<Mutation<Message>> {
    lifecycle::require_member(conversation, issuer)?;
    lifecycle::require_open(conversation)?;

    if draft.content.trim().is_empty() && draft.medias.is_empty() {
        return Err(SyncError::invalid("message has neither content nor media"));
    }
    if let Some(media) = draft
        .medias
        .iter()
        .find(|m| m.conversation_id != conversation.id || m.issuer_id != issuer)
    {
        return Err(SyncError::invalid(format!(
            "media {} does not belong to {} in {}",
            media.id, issuer, conversation.id
        )));
    }

    let message = Message {
        id,
        conversation_id: conversation.id.clone(),
        issuer_id: issuer.to_string(),
        content: draft.content,
        medias: draft.medias,
        reacts: Vec::new(),
        votes: BTreeMap::new(),
        timestamp: now,
    };
    let event = DomainEvent::MessagePosted {
        conversation_id: conversation.id.clone(),
        changed_by: issuer.to_string(),
        message: message.clone(),
    };
    Ok(Mutation::emit(message, event))
}

/// Toggle `emoji` for `issuer` on `message`.
pub fn react(
    conversation: &Conversation,
    message: &Message,
    issuer: &str,
    emoji: &str,
) -> SyncResult<Mutation<Message>> {
    lifecycle::require_member(conversation, issuer)?;
    lifecycle::require_open(conversation)?;

    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(SyncError::invalid("empty emoji"));
    }

    let mut next = message.clone();
    if next.has_react(issuer, emoji) {
        next.reacts
            .retain(|r| !(r.issuer_id == issuer && r.emoji == emoji));
    } else {
        next.reacts.push(React {
            emoji: emoji.to_string(),
            issuer_id: issuer.to_string(),
        });
    }

    let event = DomainEvent::ReactionChanged {
        conversation_id: conversation.id.clone(),
        changed_by: issuer.to_string(),
        message: next.clone(),
    };
    Ok(Mutation::emit(next, event))
}

/// Record `voter`'s vote for `votee`, replacing any earlier vote on this
/// message.
pub fn vote(
    conversation: &Conversation,
    message: &Message,
    voter: &str,
    votee: &str,
) -> SyncResult<Mutation<Message>> {
    lifecycle::require_member(conversation, voter)?;
    lifecycle::require_locked(conversation)?;
    if !conversation.is_member(votee) {
        return Err(SyncError::not_found(format!("member {}", votee)));
    }

    let mut next = message.clone();
    next.votes.insert(voter.to_string(), votee.to_string());

    let event = DomainEvent::VoteChanged {
        conversation_id: conversation.id.clone(),
        changed_by: voter.to_string(),
        message: next.clone(),
    };
    Ok(Mutation::emit(next, event))
}

/// Rename. A blank name keeps the previous one.
pub fn rename(
    conversation: &Conversation,
    actor: &str,
    new_name: &str,
) -> SyncResult<Mutation<Conversation>> {
    lifecycle::require_owner(conversation, actor)?;

    let mut next = conversation.clone();
    let trimmed = new_name.trim();
    if !trimmed.is_empty() {
        next.name = trimmed.to_string();
    }

    let event = DomainEvent::ConversationRenamed {
        conversation_id: conversation.id.clone(),
        changed_by: actor.to_string(),
        conversation: next.clone(),
    };
    Ok(Mutation::emit(next, event))
}

pub fn set_lock(
    conversation: &Conversation,
    actor: &str,
    locked: bool,
) -> SyncResult<Mutation<Conversation>> {
    let (next, transition) = lifecycle::set_flag(conversation, actor, Flag::Lock, locked)?;
    Ok(flag_mutation(next, actor, transition, |conversation_id, changed_by, conversation| {
        DomainEvent::LockChanged {
            conversation_id,
            changed_by,
            conversation,
        }
    }))
}

pub fn set_visibility(
    conversation: &Conversation,
    actor: &str,
    visible: bool,
) -> SyncResult<Mutation<Conversation>> {
    let (next, transition) = lifecycle::set_flag(conversation, actor, Flag::Visibility, visible)?;
    Ok(flag_mutation(next, actor, transition, |conversation_id, changed_by, conversation| {
        DomainEvent::VisibilityChanged {
            conversation_id,
            changed_by,
            conversation,
        }
    }))
}

fn flag_mutation(
    next: Conversation,
    actor: &str,
    transition: Transition,
    make_event: impl FnOnce(String, String, Conversation) -> DomainEvent,
) -> Mutation<Conversation> {
    match transition {
        Transition::Unchanged => Mutation::silent(next),
        Transition::Changed { effect, .. } => {
            let event = make_event(next.id.clone(), actor.to_string(), next.clone());
            Mutation {
                state: next,
                event: Some(event),
                effect,
            }
        }
    }
}

/// Update the actor's own pseudo/smiley. `None` leaves a field as is; an
/// empty (or blank) string clears it.
pub fn update_membership(
    conversation: &Conversation,
    membership: &Membership,
    actor: &str,
    pseudo: Option<&str>,
    smiley: Option<&str>,
) -> SyncResult<Mutation<Membership>> {
    if actor != membership.user_id {
        return Err(SyncError::forbidden(format!(
            "{} cannot edit {}'s membership",
            actor, membership.user_id
        )));
    }

    let mut next = membership.clone();
    if let Some(pseudo) = pseudo {
        next.pseudo = non_blank(pseudo);
    }
    if let Some(smiley) = smiley {
        next.smiley = non_blank(smiley);
    }

    let event = DomainEvent::MembershipDataChanged {
        conversation_id: conversation.id.clone(),
        changed_by: actor.to_string(),
        membership: next.clone(),
    };
    Ok(Mutation::emit(next, event))
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Outcome of a join: the conversation as it now stands and the user's
/// membership (new or pre-existing).
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    pub conversation: Conversation,
    pub membership: Membership,
    pub newly_joined: bool,
}

/// Join is idempotent. A repeated join changes nothing and is silent unless
/// `announce_rejoin` is set.
pub fn join(
    conversation: &Conversation,
    existing: Option<&Membership>,
    user: &str,
    now: DateTime<Utc>,
    announce_rejoin: bool,
) -> Mutation<Joined> {
    let (next, membership, newly_joined) = match existing {
        Some(membership) if conversation.is_member(user) => {
            (conversation.clone(), membership.clone(), false)
        }
        _ => {
            let mut next = conversation.clone();
            if !next.is_member(user) {
                next.member_ids.push(user.to_string());
            }
            (next, Membership::new(&conversation.id, user, now), true)
        }
    };

    let event = (newly_joined || announce_rejoin).then(|| DomainEvent::UserJoined {
        conversation_id: next.id.clone(),
        changed_by: user.to_string(),
        conversation: next.clone(),
        membership: membership.clone(),
    });

    Mutation {
        state: Joined {
            conversation: next,
            membership,
            newly_joined,
        },
        event,
        effect: None,
    }
}

/// Remove `user`. If they owned the conversation, ownership passes to the
/// earliest remaining member.
pub fn leave(conversation: &Conversation, user: &str) -> SyncResult<Mutation<Conversation>> {
    if !conversation.is_member(user) {
        return Err(SyncError::not_found(format!(
            "member {} in {}",
            user, conversation.id
        )));
    }
    if conversation.member_ids.len() == 1 {
        return Err(SyncError::invalid("the last member cannot leave"));
    }

    let mut next = conversation.clone();
    next.member_ids.retain(|id| id != user);
    if next.owner_id == user {
        next.owner_id = next.member_ids[0].clone();
    }

    let event = DomainEvent::UserLeft {
        conversation_id: conversation.id.clone(),
        changed_by: user.to_string(),
        conversation: next.clone(),
    };
    Ok(Mutation::emit(next, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(locked: bool) -> Conversation {
        let (mut conv, _) = create_conversation("C1".into(), "owner", Some("Soirée"), locked, false, Utc::now());
        conv.member_ids.extend(["alice".to_string(), "bob".to_string()]);
        conv
    }

    fn message(conv: &Conversation) -> Message {
        post_message(
            &Conversation {
                is_locked: false,
                ..conv.clone()
            },
            "owner",
            MessageDraft {
                content: "hello".into(),
                medias: vec![],
            },
            "m1".into(),
            Utc::now(),
        )
        .unwrap()
        .state
    }

    fn reacts(m: &Message) -> Vec<(&str, &str)> {
        m.reacts
            .iter()
            .map(|r| (r.emoji.as_str(), r.issuer_id.as_str()))
            .collect()
    }

    #[test]
    fn create_defaults_name_and_owner() {
        let (conv, owner) = create_conversation("C9".into(), "u1", Some("   "), false, false, Utc::now());
        assert_eq!(conv.name, DEFAULT_CONVERSATION_NAME);
        assert_eq!(conv.owner_id, "u1");
        assert_eq!(conv.member_ids, vec!["u1"]);
        assert_eq!(owner.user_id, "u1");
    }

    #[test]
    fn react_toggle_scenario() {
        let conv = conversation(false);
        let m = message(&conv);
        assert!(m.reacts.is_empty());

        let m = react(&conv, &m, "alice", "👍").unwrap().state;
        assert_eq!(reacts(&m), vec![("👍", "alice")]);

        let m = react(&conv, &m, "alice", "👍").unwrap().state;
        assert!(m.reacts.is_empty());

        let m = react(&conv, &m, "bob", "👍").unwrap().state;
        assert_eq!(reacts(&m), vec![("👍", "bob")]);
    }

    #[test]
    fn repeated_reacts_alternate_and_never_duplicate() {
        let conv = conversation(false);
        let mut m = message(&conv);
        for i in 0..9 {
            m = react(&conv, &m, "alice", "🍺").unwrap().state;
            let count = m
                .reacts
                .iter()
                .filter(|r| r.issuer_id == "alice" && r.emoji == "🍺")
                .count();
            assert_eq!(count, if i % 2 == 0 { 1 } else { 0 });
        }
    }

    #[test]
    fn distinct_emoji_coexist_for_one_user() {
        let conv = conversation(false);
        let m = message(&conv);
        let m = react(&conv, &m, "alice", "👍").unwrap().state;
        let m = react(&conv, &m, "alice", "😂").unwrap().state;
        assert_eq!(reacts(&m), vec![("👍", "alice"), ("😂", "alice")]);
    }

    #[test]
    fn react_event_carries_full_message() {
        let conv = conversation(false);
        let m = message(&conv);
        let mutation = react(&conv, &m, "alice", "👍").unwrap();
        match mutation.event.unwrap() {
            DomainEvent::ReactionChanged { message, changed_by, .. } => {
                assert_eq!(message, mutation.state);
                assert_eq!(changed_by, "alice");
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn vote_overwrites_previous_choice() {
        let conv = conversation(true);
        let m = message(&conv);

        let m = vote(&conv, &m, "alice", "bob").unwrap().state;
        assert_eq!(m.votes.get("alice").map(String::as_str), Some("bob"));

        let m = vote(&conv, &m, "alice", "owner").unwrap().state;
        assert_eq!(m.votes.len(), 1);
        assert_eq!(m.votes.get("alice").map(String::as_str), Some("owner"));

        let m = vote(&conv, &m, "bob", "alice").unwrap().state;
        assert_eq!(m.votes.len(), 2);
    }

    #[test]
    fn react_and_vote_respect_lock() {
        let open = conversation(false);
        let locked = conversation(true);
        let m = message(&open);

        assert!(matches!(react(&locked, &m, "alice", "👍"), Err(SyncError::Locked)));
        assert!(matches!(vote(&open, &m, "alice", "bob"), Err(SyncError::NotLocked)));
    }

    #[test]
    fn vote_for_non_member_is_not_found() {
        let conv = conversation(true);
        let m = message(&conv);
        assert!(matches!(
            vote(&conv, &m, "alice", "stranger"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn post_requires_member_and_open_conversation() {
        let open = conversation(false);
        let draft = || MessageDraft {
            content: "hi".into(),
            medias: vec![],
        };
        assert!(matches!(
            post_message(&open, "stranger", draft(), "m".into(), Utc::now()),
            Err(SyncError::Forbidden(_))
        ));
        assert!(matches!(
            post_message(&conversation(true), "alice", draft(), "m".into(), Utc::now()),
            Err(SyncError::Locked)
        ));
        assert!(matches!(
            post_message(&open, "alice", MessageDraft::default(), "m".into(), Utc::now()),
            Err(SyncError::Invalid(_))
        ));
    }

    #[test]
    fn rename_is_owner_only_and_keeps_name_when_blank() {
        let conv = conversation(false);
        assert!(matches!(rename(&conv, "alice", "x"), Err(SyncError::Forbidden(_))));

        let renamed = rename(&conv, "owner", "  After party  ").unwrap();
        assert_eq!(renamed.state.name, "After party");

        let blank = rename(&renamed.state, "owner", "   ").unwrap();
        assert_eq!(blank.state.name, "After party");
        assert!(blank.event.is_some());
    }

    #[test]
    fn set_lock_twice_emits_once() {
        let conv = conversation(false);
        let first = set_lock(&conv, "owner", true).unwrap();
        assert!(matches!(first.event, Some(DomainEvent::LockChanged { .. })));
        assert_eq!(first.effect, Some(SideEffect::GenerateAnalysis));

        let second = set_lock(&first.state, "owner", true).unwrap();
        assert!(second.event.is_none());
        assert!(second.effect.is_none());
    }

    #[test]
    fn visibility_scenario() {
        let conv = conversation(false);
        let shown = set_visibility(&conv, "owner", true).unwrap();
        match shown.event.unwrap() {
            DomainEvent::VisibilityChanged { conversation, .. } => assert!(conversation.is_visible),
            other => panic!("unexpected {}", other.kind()),
        }
        assert!(matches!(
            set_visibility(&conv, "alice", true),
            Err(SyncError::Forbidden(_))
        ));
    }

    #[test]
    fn membership_update_semantics() {
        let conv = conversation(false);
        let mut membership = Membership::new("C1", "alice", Utc::now());
        membership.smiley = Some("🐸".into());

        assert!(matches!(
            update_membership(&conv, &membership, "bob", Some("x"), None),
            Err(SyncError::Forbidden(_))
        ));

        let updated = update_membership(&conv, &membership, "alice", Some("Ali"), None)
            .unwrap()
            .state;
        assert_eq!(updated.pseudo.as_deref(), Some("Ali"));
        assert_eq!(updated.smiley.as_deref(), Some("🐸"));

        let cleared = update_membership(&conv, &updated, "alice", None, Some(""))
            .unwrap()
            .state;
        assert_eq!(cleared.pseudo.as_deref(), Some("Ali"));
        assert_eq!(cleared.smiley, None);
    }

    #[test]
    fn join_is_idempotent() {
        let conv = conversation(false);
        let first = join(&conv, None, "carol", Utc::now(), false);
        assert!(first.state.newly_joined);
        assert!(matches!(first.event, Some(DomainEvent::UserJoined { .. })));
        assert_eq!(first.state.conversation.member_ids.last().unwrap(), "carol");

        let again = join(
            &first.state.conversation,
            Some(&first.state.membership),
            "carol",
            Utc::now(),
            false,
        );
        assert!(!again.state.newly_joined);
        assert!(again.event.is_none());
        assert_eq!(again.state.conversation.member_ids, first.state.conversation.member_ids);

        let announced = join(
            &first.state.conversation,
            Some(&first.state.membership),
            "carol",
            Utc::now(),
            true,
        );
        assert!(announced.event.is_some());
    }

    #[test]
    fn owner_leaving_hands_over_to_earliest_member() {
        let conv = conversation(false);
        let left = leave(&conv, "owner").unwrap().state;
        assert_eq!(left.owner_id, "alice");
        assert_eq!(left.member_ids, vec!["alice", "bob"]);

        assert!(matches!(leave(&left, "owner"), Err(SyncError::NotFound(_))));

        let (solo, _) = create_conversation("C2".into(), "u", None, false, false, Utc::now());
        assert!(matches!(leave(&solo, "u"), Err(SyncError::Invalid(_))));
    }
}
