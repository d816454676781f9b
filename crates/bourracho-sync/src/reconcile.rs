//! Client-side view of one conversation.
//!
//! A client subscribes, fetches a [`ConversationSnapshot`], then feeds every
//! received event through [`ConversationView::apply`]. Events carry full
//! entity snapshots, so de-duplication is purely by id: a `MessagePosted`
//! for a known id is a no-op and every other variant replaces by id.
//!
//! Events received before the snapshot arrived may already be reflected in
//! it. [`ConversationView::resync`] swaps in the snapshot and replays the
//! recent-event window in arrival order; since the hub preserves commit order
//! per subscriber, the last event for each entity wins and the view converges.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use bourracho_types::events::DomainEvent;
use bourracho_types::models::{Conversation, ConversationSnapshot, Membership, Message};

pub const DEFAULT_WINDOW: usize = 512;

/// What applying one event did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    /// Already reflected; the view is unchanged.
    Duplicate,
    /// Addressed to another conversation.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConversationView {
    conversation: Conversation,
    memberships: Vec<Membership>,
    /// Ordered the way the server lists them.
    messages: BTreeMap<(DateTime<Utc>, String), Message>,
    timestamps: HashMap<String, DateTime<Utc>>,
    window: VecDeque<DomainEvent>,
    window_size: usize,
}

impl ConversationView {
    pub fn new(snapshot: ConversationSnapshot) -> Self {
        Self::with_window(snapshot, DEFAULT_WINDOW)
    }

    pub fn with_window(snapshot: ConversationSnapshot, window_size: usize) -> Self {
        let mut view = Self {
            conversation: snapshot.conversation.clone(),
            memberships: Vec::new(),
            messages: BTreeMap::new(),
            timestamps: HashMap::new(),
            window: VecDeque::with_capacity(window_size.min(DEFAULT_WINDOW)),
            window_size,
        };
        view.load(snapshot);
        view
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn memberships(&self) -> &[Membership] {
        &self.memberships
    }

    pub fn membership(&self, user_id: &str) -> Option<&Membership> {
        self.memberships.iter().find(|m| m.user_id == user_id)
    }

    /// Pseudo when set, user id otherwise.
    pub fn display_name<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.membership(user_id)
            .and_then(|m| m.pseudo.as_deref())
            .unwrap_or(user_id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        let ts = self.timestamps.get(id)?;
        self.messages.get(&(*ts, id.to_string()))
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Apply one live event and remember it for the next [`resync`].
    ///
    /// [`resync`]: ConversationView::resync
    pub fn apply(&mut self, event: &DomainEvent) -> Applied {
        let applied = self.apply_inner(event);
        if applied != Applied::Ignored && self.window_size > 0 {
            if self.window.len() == self.window_size {
                self.window.pop_front();
            }
            self.window.push_back(event.clone());
        }
        trace!("{} on {} -> {:?}", event.kind(), event.conversation_id(), applied);
        applied
    }

    /// Decode and apply a raw frame. A frame that fails to parse leaves the
    /// view untouched.
    pub fn apply_json(&mut self, frame: &str) -> Result<Applied, serde_json::Error> {
        let event: DomainEvent = serde_json::from_str(frame)?;
        Ok(self.apply(&event))
    }

    /// Replace the state with a fresh snapshot, then replay recent events.
    pub fn resync(&mut self, snapshot: ConversationSnapshot) {
        if snapshot.conversation.id != self.conversation.id {
            debug!(
                "Ignoring snapshot of {} for view of {}",
                snapshot.conversation.id, self.conversation.id
            );
            return;
        }
        self.load(snapshot);
        let replay: Vec<DomainEvent> = self.window.iter().cloned().collect();
        for event in &replay {
            self.apply_inner(event);
        }
        debug!(
            "Resynced {} and replayed {} event(s)",
            self.conversation.id,
            replay.len()
        );
    }

    fn load(&mut self, snapshot: ConversationSnapshot) {
        self.conversation = snapshot.conversation;
        self.memberships = snapshot.memberships;
        self.messages.clear();
        self.timestamps.clear();
        for message in snapshot.messages {
            self.upsert_message(&message);
        }
    }

    fn apply_inner(&mut self, event: &DomainEvent) -> Applied {
        if event.conversation_id() != self.conversation.id {
            return Applied::Ignored;
        }
        match event {
            DomainEvent::MessagePosted { message, .. } => {
                if self.timestamps.contains_key(&message.id) {
                    Applied::Duplicate
                } else {
                    self.upsert_message(message)
                }
            }
            DomainEvent::ReactionChanged { message, .. }
            | DomainEvent::VoteChanged { message, .. } => self.upsert_message(message),
            DomainEvent::ConversationRenamed { conversation, .. }
            | DomainEvent::LockChanged { conversation, .. }
            | DomainEvent::VisibilityChanged { conversation, .. } => {
                self.replace_conversation(conversation)
            }
            DomainEvent::MembershipDataChanged { membership, .. } => {
                self.upsert_membership(membership)
            }
            DomainEvent::UserJoined {
                conversation,
                membership,
                ..
            } => {
                let c = self.replace_conversation(conversation);
                let m = self.upsert_membership(membership);
                merge(c, m)
            }
            DomainEvent::UserLeft {
                conversation,
                changed_by,
                ..
            } => {
                let c = self.replace_conversation(conversation);
                let before = self.memberships.len();
                self.memberships.retain(|m| &m.user_id != changed_by);
                if self.memberships.len() != before {
                    Applied::Replaced
                } else {
                    c
                }
            }
        }
    }

    fn upsert_message(&mut self, message: &Message) -> Applied {
        let key = (message.timestamp, message.id.clone());
        match self.timestamps.insert(message.id.clone(), message.timestamp) {
            None => {
                self.messages.insert(key, message.clone());
                Applied::Inserted
            }
            Some(old_ts) => {
                let old = self.messages.remove(&(old_ts, message.id.clone()));
                let applied = if old.as_ref() == Some(message) {
                    Applied::Duplicate
                } else {
                    Applied::Replaced
                };
                self.messages.insert(key, message.clone());
                applied
            }
        }
    }

    fn replace_conversation(&mut self, conversation: &Conversation) -> Applied {
        if &self.conversation == conversation {
            Applied::Duplicate
        } else {
            self.conversation = conversation.clone();
            Applied::Replaced
        }
    }

    fn upsert_membership(&mut self, membership: &Membership) -> Applied {
        match self
            .memberships
            .iter_mut()
            .find(|m| m.user_id == membership.user_id)
        {
            Some(existing) if existing == membership => Applied::Duplicate,
            Some(existing) => {
                *existing = membership.clone();
                Applied::Replaced
            }
            None => {
                self.memberships.push(membership.clone());
                Applied::Inserted
            }
        }
    }
}

fn merge(a: Applied, b: Applied) -> Applied {
    match (a, b) {
        (Applied::Duplicate, Applied::Duplicate) => Applied::Duplicate,
        (Applied::Inserted, _) | (_, Applied::Inserted) => Applied::Inserted,
        _ => Applied::Replaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation() -> Conversation {
        Conversation {
            id: "C1".into(),
            name: "Friday".into(),
            owner_id: "u1".into(),
            member_ids: vec!["u1".into(), "u2".into()],
            is_locked: false,
            is_visible: false,
            created_at: Utc::now(),
        }
    }

    fn message(id: &str, offset_ms: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: "C1".into(),
            issuer_id: "u1".into(),
            content: format!("msg {}", id),
            medias: vec![],
            reacts: vec![],
            votes: BTreeMap::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(offset_ms),
        }
    }

    fn snapshot(messages: Vec<Message>) -> ConversationSnapshot {
        let now = Utc::now();
        ConversationSnapshot {
            conversation: conversation(),
            memberships: vec![Membership::new("C1", "u1", now), Membership::new("C1", "u2", now)],
            messages,
        }
    }

    fn posted(m: &Message) -> DomainEvent {
        DomainEvent::MessagePosted {
            conversation_id: "C1".into(),
            changed_by: m.issuer_id.clone(),
            message: m.clone(),
        }
    }

    fn reacted(m: &Message, emoji: &str, by: &str) -> (Message, DomainEvent) {
        let mut next = m.clone();
        next.reacts.push(bourracho_types::models::React {
            emoji: emoji.into(),
            issuer_id: by.into(),
        });
        let event = DomainEvent::ReactionChanged {
            conversation_id: "C1".into(),
            changed_by: by.into(),
            message: next.clone(),
        };
        (next, event)
    }

    #[test]
    fn fetched_message_then_posted_event_is_not_duplicated() {
        let m1 = message("m1", 10);
        let mut view = ConversationView::new(snapshot(vec![m1.clone()]));

        assert_eq!(view.apply(&posted(&m1)), Applied::Duplicate);
        assert_eq!(view.message_count(), 1);

        let m2 = message("m2", 20);
        assert_eq!(view.apply(&posted(&m2)), Applied::Inserted);
        assert_eq!(view.apply(&posted(&m2)), Applied::Duplicate);
        assert_eq!(view.message_count(), 2);
    }

    #[test]
    fn reaction_event_replaces_by_id_and_is_idempotent() {
        let m1 = message("m1", 10);
        let mut view = ConversationView::new(snapshot(vec![m1.clone()]));
        let (next, event) = reacted(&m1, "👍", "u2");

        assert_eq!(view.apply(&event), Applied::Replaced);
        assert_eq!(view.apply(&event), Applied::Duplicate);
        assert_eq!(view.message("m1"), Some(&next));
    }

    #[test]
    fn messages_stay_in_timestamp_order() {
        let mut view = ConversationView::new(snapshot(vec![message("b", 20)]));
        view.apply(&posted(&message("c", 30)));
        view.apply(&posted(&message("a", 10)));
        let ids: Vec<&str> = view.messages().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn resync_replays_window_and_converges() {
        let m1 = message("m1", 10);
        let mut view = ConversationView::new(snapshot(vec![m1.clone()]));

        // Events arrive, then a fresh fetch that already includes the first.
        let (r1, e1) = reacted(&m1, "👍", "u2");
        let (r2, e2) = reacted(&r1, "🍺", "u1");
        let m2 = message("m2", 20);
        view.apply(&e1);
        view.apply(&posted(&m2));
        view.apply(&e2);

        view.resync(snapshot(vec![r1, m2.clone()]));
        assert_eq!(view.message("m1"), Some(&r2));
        assert_eq!(view.message("m2"), Some(&m2));
        assert_eq!(view.message_count(), 2);
    }

    #[test]
    fn membership_events_update_in_place() {
        let mut view = ConversationView::new(snapshot(vec![]));
        let mut m = Membership::new("C1", "u2", Utc::now());
        m.pseudo = Some("Bibi".into());
        let event = DomainEvent::MembershipDataChanged {
            conversation_id: "C1".into(),
            changed_by: "u2".into(),
            membership: m,
        };
        assert_eq!(view.apply(&event), Applied::Replaced);
        assert_eq!(view.display_name("u2"), "Bibi");
        assert_eq!(view.display_name("u1"), "u1");
        assert_eq!(view.memberships().len(), 2);
    }

    #[test]
    fn user_left_removes_membership() {
        let mut view = ConversationView::new(snapshot(vec![]));
        let mut conv = conversation();
        conv.member_ids.retain(|id| id != "u2");
        let event = DomainEvent::UserLeft {
            conversation_id: "C1".into(),
            changed_by: "u2".into(),
            conversation: conv,
        };
        assert_eq!(view.apply(&event), Applied::Replaced);
        assert!(view.membership("u2").is_none());
        assert_eq!(view.apply(&event), Applied::Duplicate);
    }

    #[test]
    fn other_conversation_and_bad_frames_leave_view_untouched() {
        let mut view = ConversationView::new(snapshot(vec![]));
        let mut foreign = message("x", 5);
        foreign.conversation_id = "C2".into();
        let event = DomainEvent::MessagePosted {
            conversation_id: "C2".into(),
            changed_by: "u1".into(),
            message: foreign,
        };
        assert_eq!(view.apply(&event), Applied::Ignored);
        assert!(view.apply_json("{\"type\":\"Nope\"}").is_err());
        assert_eq!(view.message_count(), 0);
    }
}
