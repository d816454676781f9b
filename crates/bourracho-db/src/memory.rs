use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{Result, anyhow, bail};

use bourracho_types::models::{AnalysisState, Conversation, MediaAttachment, Membership, Message};

use crate::EntityStore;

/// In-process [`EntityStore`] with the same observable behaviour as the
/// SQLite store. Used for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    /// conversation id -> memberships in join order
    memberships: HashMap<String, Vec<Membership>>,
    messages: HashMap<String, Message>,
    medias: HashMap<String, MediaAttachment>,
    attached_medias: HashSet<String>,
    analyses: HashMap<String, AnalysisState>,
}

impl Tables {
    fn hydrate(&self, conversation: &Conversation) -> Conversation {
        let mut conversation = conversation.clone();
        conversation.member_ids = self
            .memberships
            .get(&conversation.id)
            .map(|ms| ms.iter().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default();
        conversation
    }

    /// Only name, owner and flags are mutable.
    fn store_conversation(&mut self, conversation: &Conversation) {
        if let Some(stored) = self.conversations.get_mut(&conversation.id) {
            stored.name = conversation.name.clone();
            stored.owner_id = conversation.owner_id.clone();
            stored.is_locked = conversation.is_locked;
            stored.is_visible = conversation.is_visible;
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.inner
            .read()
            .map_err(|e| anyhow!("memory store lock poisoned: {}", e))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.inner
            .write()
            .map_err(|e| anyhow!("memory store lock poisoned: {}", e))
    }
}

impl EntityStore for MemoryStore {
    fn insert_conversation(&self, conversation: &Conversation, owner: &Membership) -> Result<()> {
        let mut tables = self.write()?;
        if tables.conversations.contains_key(&conversation.id) {
            bail!("conversation {} already exists", conversation.id);
        }
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        tables
            .memberships
            .insert(conversation.id.clone(), vec![owner.clone()]);
        Ok(())
    }

    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let tables = self.read()?;
        Ok(tables.conversations.get(id).map(|c| tables.hydrate(c)))
    }

    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let tables = self.read()?;
        let mut found: Vec<Conversation> = tables
            .conversations
            .values()
            .map(|c| tables.hydrate(c))
            .filter(|c| c.is_member(user_id))
            .collect();
        found.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(found)
    }

    fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write()?.store_conversation(conversation);
        Ok(())
    }

    fn update_conversation_and_analysis(
        &self,
        conversation: &Conversation,
        analysis: &AnalysisState,
    ) -> Result<()> {
        let mut tables = self.write()?;
        tables.store_conversation(conversation);
        tables
            .analyses
            .insert(conversation.id.clone(), analysis.clone());
        Ok(())
    }

    fn insert_membership(&self, membership: &Membership) -> Result<()> {
        let mut tables = self.write()?;
        if !tables.conversations.contains_key(&membership.conversation_id) {
            bail!("conversation {} does not exist", membership.conversation_id);
        }
        let members = tables
            .memberships
            .entry(membership.conversation_id.clone())
            .or_default();
        if members.iter().any(|m| m.user_id == membership.user_id) {
            bail!(
                "user {} is already a member of {}",
                membership.user_id,
                membership.conversation_id
            );
        }
        members.push(membership.clone());
        Ok(())
    }

    fn update_membership(&self, membership: &Membership) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(stored) = tables
            .memberships
            .get_mut(&membership.conversation_id)
            .and_then(|ms| ms.iter_mut().find(|m| m.user_id == membership.user_id))
        {
            stored.pseudo = membership.pseudo.clone();
            stored.smiley = membership.smiley.clone();
        }
        Ok(())
    }

    fn remove_member(&self, conversation: &Conversation, user_id: &str) -> Result<()> {
        let mut tables = self.write()?;
        let members = tables
            .memberships
            .get_mut(&conversation.id)
            .filter(|ms| ms.iter().any(|m| m.user_id == user_id))
            .ok_or_else(|| anyhow!("user {} is not a member of {}", user_id, conversation.id))?;
        members.retain(|m| m.user_id != user_id);
        tables.store_conversation(conversation);
        Ok(())
    }

    fn get_membership(&self, conversation_id: &str, user_id: &str) -> Result<Option<Membership>> {
        let tables = self.read()?;
        Ok(tables
            .memberships
            .get(conversation_id)
            .and_then(|ms| ms.iter().find(|m| m.user_id == user_id))
            .cloned())
    }

    fn list_memberships(&self, conversation_id: &str) -> Result<Vec<Membership>> {
        let tables = self.read()?;
        Ok(tables
            .memberships
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    fn insert_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.write()?;
        if tables.messages.contains_key(&message.id) {
            bail!("message {} already exists", message.id);
        }
        for media in &message.medias {
            tables.attached_medias.insert(media.id.clone());
        }
        tables.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.read()?.messages.get(id).cloned())
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(stored) = tables.messages.get_mut(&message.id) {
            stored.reacts = message.reacts.clone();
            stored.votes = message.votes.clone();
        }
        Ok(())
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let tables = self.read()?;
        let mut messages: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(messages)
    }

    fn insert_media(&self, media: &MediaAttachment) -> Result<()> {
        self.write()?.medias.insert(media.id.clone(), media.clone());
        Ok(())
    }

    fn get_media(&self, id: &str) -> Result<Option<MediaAttachment>> {
        Ok(self.read()?.medias.get(id).cloned())
    }

    fn is_media_attached(&self, id: &str) -> Result<bool> {
        Ok(self.read()?.attached_medias.contains(id))
    }

    fn save_analysis(&self, conversation_id: &str, state: &AnalysisState) -> Result<()> {
        self.write()?
            .analyses
            .insert(conversation_id.to_string(), state.clone());
        Ok(())
    }

    fn get_analysis(&self, conversation_id: &str) -> Result<Option<AnalysisState>> {
        Ok(self.read()?.analyses.get(conversation_id).cloned())
    }

    fn ping(&self) -> Result<()> {
        self.read().map(drop)
    }
}
