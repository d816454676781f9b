use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bourracho_db::EntityStore;
use bourracho_gateway::connection::{CommandHandler, Rejection};
use bourracho_gateway::Dispatcher;
use bourracho_types::api::CreateConversationRequest;
use bourracho_types::events::{DomainEvent, GatewayCommand};
use bourracho_types::models::{
    AnalysisState, Conversation, ConversationSnapshot, MediaAttachment, Membership, Message,
};

use crate::analysis::AnalysisGenerator;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{self, SideEffect};
use crate::locks::ConversationLocks;
use crate::mutators::{self, Joined, MessageDraft};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Re-emit `UserJoined` when an existing member joins again.
    pub announce_rejoin: bool,
}

/// Applies commands to conversations.
///
/// Every command on a conversation runs inside that conversation's critical
/// section: load, validate, persist, then queue the event on the dispatcher.
/// Queueing never blocks, so holding the section across publish keeps each
/// subscriber's stream in commit order without stalling on slow sockets.
pub struct Engine {
    store: Arc<dyn EntityStore>,
    dispatcher: Dispatcher,
    analysis: Arc<dyn AnalysisGenerator>,
    locks: Arc<ConversationLocks>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Dispatcher,
        analysis: Arc<dyn AnalysisGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            analysis,
            locks: Arc::new(ConversationLocks::new()),
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Conversations --

    pub async fn create_conversation(
        &self,
        creator: &str,
        req: CreateConversationRequest,
    ) -> SyncResult<Conversation> {
        let result = self.insert_with_fresh_code(creator, req).await;
        self.tally("create_conversation", result)
    }

    async fn insert_with_fresh_code(
        &self,
        creator: &str,
        req: CreateConversationRequest,
    ) -> SyncResult<Conversation> {
        for _ in 0..CODE_ATTEMPTS {
            let id = generate_code();
            let _guard = self.locks.acquire(&id).await;

            let candidate = id.clone();
            if self.db(move |s| s.get_conversation(&candidate)).await?.is_some() {
                debug!("Conversation code {} already taken, retrying", id);
                continue;
            }

            let (conversation, owner) = mutators::create_conversation(
                id,
                creator,
                req.name.as_deref(),
                req.is_locked.unwrap_or(false),
                req.is_visible.unwrap_or(false),
                Utc::now(),
            );
            let (c, o) = (conversation.clone(), owner);
            self.db(move |s| s.insert_conversation(&c, &o)).await?;

            info!(
                "{} created conversation {} ({})",
                creator, conversation.id, conversation.name
            );
            return Ok(conversation);
        }
        Err(SyncError::Storage(anyhow::anyhow!(
            "no free conversation code after {} attempts",
            CODE_ATTEMPTS
        )))
    }

    pub async fn list_conversations(&self, user_id: &str) -> SyncResult<Vec<Conversation>> {
        let user = user_id.to_string();
        self.db(move |s| s.list_conversations_for_user(&user)).await
    }

    /// Any authenticated user may look a conversation up by its code, which
    /// is how they find it before joining.
    pub async fn get_conversation(&self, conversation_id: &str) -> SyncResult<Conversation> {
        self.load_conversation(conversation_id).await
    }

    /// Authoritative point-in-time view, consistent with the event stream:
    /// every event published after this returns reflects a later commit.
    pub async fn snapshot(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> SyncResult<ConversationSnapshot> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.load_conversation(conversation_id).await?;
        lifecycle::require_member(&conversation, user_id)?;
        self.read_snapshot(conversation).await
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> SyncResult<Vec<Message>> {
        Ok(self.snapshot(conversation_id, user_id).await?.messages)
    }

    /// Membership check used before opening a live subscription.
    pub async fn ensure_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> SyncResult<Conversation> {
        let conversation = self.load_conversation(conversation_id).await?;
        lifecycle::require_member(&conversation, user_id)?;
        Ok(conversation)
    }

    pub async fn join(&self, conversation_id: &str, user_id: &str) -> SyncResult<Joined> {
        let result: SyncResult<Joined> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;

            let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
            let existing = self.db(move |s| s.get_membership(&cid, &uid)).await?;

            let mutation = mutators::join(
                &conversation,
                existing.as_ref(),
                user_id,
                Utc::now(),
                self.config.announce_rejoin,
            );
            if mutation.state.newly_joined {
                let membership = mutation.state.membership.clone();
                self.db(move |s| s.insert_membership(&membership)).await?;
                info!("{} joined {}", user_id, conversation_id);
            } else {
                debug!("{} re-joined {}", user_id, conversation_id);
            }

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("join", result)
    }

    /// Removes the membership (handing ownership over if needed), then cuts
    /// the leaver's live subscriptions once `UserLeft` is queued for them.
    pub async fn leave(&self, conversation_id: &str, user_id: &str) -> SyncResult<Conversation> {
        let result: SyncResult<Conversation> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;

            let mutation = mutators::leave(&conversation, user_id)?;
            let (next, uid) = (mutation.state.clone(), user_id.to_string());
            self.db(move |s| s.remove_member(&next, &uid)).await?;

            if mutation.state.owner_id != conversation.owner_id {
                info!(
                    "{} left {}, ownership passed to {}",
                    user_id, conversation_id, mutation.state.owner_id
                );
            } else {
                info!("{} left {}", user_id, conversation_id);
            }

            self.publish(mutation.event);
            self.dispatcher.unsubscribe_user(conversation_id, user_id);
            Ok(mutation.state)
        }
        .await;
        self.tally("leave", result)
    }

    pub async fn rename(
        &self,
        conversation_id: &str,
        actor: &str,
        name: &str,
    ) -> SyncResult<Conversation> {
        let result: SyncResult<Conversation> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;

            let mutation = mutators::rename(&conversation, actor, name)?;
            self.save_conversation(&mutation.state).await?;

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("rename", result)
    }

    pub async fn set_lock(
        &self,
        conversation_id: &str,
        actor: &str,
        locked: bool,
    ) -> SyncResult<Conversation> {
        let result: SyncResult<Conversation> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;

            let mutation = mutators::set_lock(&conversation, actor, locked)?;
            if mutation.event.is_none() {
                return Ok(mutation.state);
            }

            // A lock and its pending analysis commit together or not at all.
            let requested_at = if mutation.effect == Some(SideEffect::GenerateAnalysis) {
                let (requested_at, pending) = self.pending_analysis(conversation_id).await?;
                let next = mutation.state.clone();
                self.db(move |s| s.update_conversation_and_analysis(&next, &pending))
                    .await?;
                Some(requested_at)
            } else {
                self.save_conversation(&mutation.state).await?;
                None
            };
            info!(
                "{} {} {}",
                actor,
                if locked { "locked" } else { "unlocked" },
                conversation_id
            );

            self.publish(mutation.event);
            if let Some(requested_at) = requested_at {
                self.schedule_analysis(mutation.state.clone(), requested_at)
                    .await;
            }
            Ok(mutation.state)
        }
        .await;
        self.tally("set_lock", result)
    }

    pub async fn set_visibility(
        &self,
        conversation_id: &str,
        actor: &str,
        visible: bool,
    ) -> SyncResult<Conversation> {
        let result: SyncResult<Conversation> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;

            let mutation = mutators::set_visibility(&conversation, actor, visible)?;
            if mutation.event.is_none() {
                return Ok(mutation.state);
            }
            self.save_conversation(&mutation.state).await?;
            info!(
                "{} made {} {}",
                actor,
                conversation_id,
                if visible { "visible" } else { "hidden" }
            );

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("set_visibility", result)
    }

    pub async fn update_membership(
        &self,
        conversation_id: &str,
        actor: &str,
        target: &str,
        pseudo: Option<&str>,
        smiley: Option<&str>,
    ) -> SyncResult<Membership> {
        let result: SyncResult<Membership> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;
            lifecycle::require_member(&conversation, actor)?;
            // Someone else's membership is forbidden whether or not it exists.
            if actor != target {
                return Err(SyncError::forbidden(format!(
                    "{} cannot edit {}'s membership",
                    actor, target
                )));
            }

            let (cid, uid) = (conversation_id.to_string(), target.to_string());
            let membership = self
                .db(move |s| s.get_membership(&cid, &uid))
                .await?
                .ok_or_else(|| SyncError::not_found(format!("member {}", target)))?;

            let mutation =
                mutators::update_membership(&conversation, &membership, actor, pseudo, smiley)?;
            let next = mutation.state.clone();
            self.db(move |s| s.update_membership(&next)).await?;

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("update_membership", result)
    }

    // -- Messages --

    pub async fn post_message(
        &self,
        conversation_id: &str,
        issuer: &str,
        content: String,
        media_ids: Vec<String>,
    ) -> SyncResult<Message> {
        let result: SyncResult<Message> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;
            lifecycle::require_member(&conversation, issuer)?;

            let medias = self.resolve_medias(media_ids).await?;
            let mutation = mutators::post_message(
                &conversation,
                issuer,
                MessageDraft { content, medias },
                Uuid::new_v4().to_string(),
                Utc::now(),
            )?;
            let message = mutation.state.clone();
            self.db(move |s| s.insert_message(&message)).await?;
            debug!("{} posted {} in {}", issuer, mutation.state.id, conversation_id);

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("post_message", result)
    }

    pub async fn react(
        &self,
        conversation_id: &str,
        message_id: &str,
        issuer: &str,
        emoji: &str,
    ) -> SyncResult<Message> {
        let result: SyncResult<Message> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;
            lifecycle::require_member(&conversation, issuer)?;
            let message = self.load_message(conversation_id, message_id).await?;

            let mutation = mutators::react(&conversation, &message, issuer, emoji)?;
            let next = mutation.state.clone();
            self.db(move |s| s.update_message(&next)).await?;

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("react", result)
    }

    pub async fn vote(
        &self,
        conversation_id: &str,
        message_id: &str,
        voter: &str,
        votee: &str,
    ) -> SyncResult<Message> {
        let result: SyncResult<Message> = async {
            let _guard = self.locks.acquire(conversation_id).await;
            let conversation = self.load_conversation(conversation_id).await?;
            lifecycle::require_member(&conversation, voter)?;
            let message = self.load_message(conversation_id, message_id).await?;

            let mutation = mutators::vote(&conversation, &message, voter, votee)?;
            let next = mutation.state.clone();
            self.db(move |s| s.update_message(&next)).await?;

            self.publish(mutation.event);
            Ok(mutation.state)
        }
        .await;
        self.tally("vote", result)
    }

    // -- Media --

    /// Checked before a blob is written so refused uploads leave nothing on
    /// disk.
    pub async fn authorize_upload(&self, conversation_id: &str, user_id: &str) -> SyncResult<()> {
        let conversation = self.load_conversation(conversation_id).await?;
        lifecycle::require_member(&conversation, user_id)?;
        lifecycle::require_open(&conversation)
    }

    pub async fn record_media(&self, media: MediaAttachment) -> SyncResult<MediaAttachment> {
        let _guard = self.locks.acquire(&media.conversation_id).await;
        let conversation = self.load_conversation(&media.conversation_id).await?;
        lifecycle::require_member(&conversation, &media.issuer_id)?;
        lifecycle::require_open(&conversation)?;

        let stored = media.clone();
        self.db(move |s| s.insert_media(&stored)).await?;
        info!(
            "{} uploaded {} {} ({} bytes) to {}",
            media.issuer_id,
            media.kind.as_str(),
            media.id,
            media.size,
            media.conversation_id
        );
        Ok(media)
    }

    /// Media metadata, visible to members of the owning conversation.
    pub async fn get_media(&self, media_id: &str, user_id: &str) -> SyncResult<MediaAttachment> {
        let id = media_id.to_string();
        let media = self
            .db(move |s| s.get_media(&id))
            .await?
            .ok_or_else(|| SyncError::not_found(format!("media {}", media_id)))?;
        self.ensure_member(&media.conversation_id, user_id).await?;
        Ok(media)
    }

    // -- Analysis --

    /// `None` when the conversation has never been locked.
    pub async fn get_analysis(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> SyncResult<Option<AnalysisState>> {
        self.ensure_member(conversation_id, user_id).await?;
        let cid = conversation_id.to_string();
        self.db(move |s| s.get_analysis(&cid)).await
    }

    /// Pending marker for a new lock cycle, carrying forward the last ready
    /// analysis so it stays readable until the new one lands.
    async fn pending_analysis(
        &self,
        conversation_id: &str,
    ) -> SyncResult<(DateTime<Utc>, AnalysisState)> {
        let cid = conversation_id.to_string();
        let previous = match self.db(move |s| s.get_analysis(&cid)).await? {
            Some(AnalysisState::Ready { analysis, .. }) => Some(analysis),
            Some(AnalysisState::Pending { previous, .. }) => previous,
            Some(AnalysisState::Failed { .. }) | None => None,
        };
        let requested_at = Utc::now();
        Ok((
            requested_at,
            AnalysisState::Pending {
                requested_at,
                previous,
            },
        ))
    }

    /// Snapshots the conversation as it was at lock time and hands it to the
    /// generator on a background task. Runs after the lock has committed, so
    /// nothing here may fail the command: errors end up as `Failed`. The
    /// caller must hold the conversation's guard.
    async fn schedule_analysis(&self, conversation: Conversation, requested_at: DateTime<Utc>) {
        let conversation_id = conversation.id.clone();
        let snapshot = match self.read_snapshot(conversation).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let failed = AnalysisState::Failed {
                    reason: format!("could not read the conversation: {}", e),
                };
                let cid = conversation_id.clone();
                if let Err(e) = self
                    .db(move |s| settle_analysis(s, &cid, requested_at, &failed))
                    .await
                {
                    error!("Failed to record analysis failure for {}: {}", conversation_id, e);
                }
                return;
            }
        };

        let store = self.store.clone();
        let generator = self.analysis.clone();
        let locks = self.locks.clone();
        info!("Analysis scheduled for {}", conversation_id);

        tokio::spawn(async move {
            let outcome = match generator.generate(&snapshot).await {
                Ok(analysis) => {
                    info!("Analysis ready for {}", conversation_id);
                    AnalysisState::Ready {
                        analysis,
                        generated_at: Utc::now(),
                    }
                }
                Err(e) => {
                    warn!("Analysis for {} failed: {:#}", conversation_id, e);
                    AnalysisState::Failed {
                        reason: e.to_string(),
                    }
                }
            };

            let _guard = locks.acquire(&conversation_id).await;
            let cid = conversation_id.clone();
            let saved = tokio::task::spawn_blocking(move || {
                settle_analysis(store.as_ref(), &cid, requested_at, &outcome)
            })
            .await;
            match saved {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => debug!("Stale analysis for {} discarded", conversation_id),
                Ok(Err(e)) => error!("Failed to save analysis for {}: {}", conversation_id, e),
                Err(e) => error!("spawn_blocking join error: {}", e),
            }
        });
    }

    /// Liveness of the backing store, for health checks.
    pub async fn ping(&self) -> SyncResult<()> {
        self.db(|s| s.ping()).await
    }

    fn tally<T>(&self, command: &str, result: SyncResult<T>) -> SyncResult<T> {
        if let Some(metrics) = self.dispatcher.metrics() {
            let outcome = match &result {
                Ok(_) => "accepted",
                Err(e) => e.code(),
            };
            metrics.record_command(command, outcome);
        }
        result
    }

    // -- Internals --

    /// Run a store call off the async runtime.
    async fn db<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&dyn EntityStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                anyhow::anyhow!("storage task failed: {}", e)
            })?;
        result.map_err(|e| {
            error!("Storage error: {:#}", e);
            SyncError::Storage(e)
        })
    }

    async fn load_conversation(&self, conversation_id: &str) -> SyncResult<Conversation> {
        let id = conversation_id.to_string();
        self.db(move |s| s.get_conversation(&id))
            .await?
            .ok_or_else(|| SyncError::not_found(format!("conversation {}", conversation_id)))
    }

    async fn load_message(&self, conversation_id: &str, message_id: &str) -> SyncResult<Message> {
        let id = message_id.to_string();
        self.db(move |s| s.get_message(&id))
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or_else(|| SyncError::not_found(format!("message {}", message_id)))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> SyncResult<()> {
        let conversation = conversation.clone();
        self.db(move |s| s.update_conversation(&conversation)).await
    }

    async fn read_snapshot(&self, conversation: Conversation) -> SyncResult<ConversationSnapshot> {
        let id = conversation.id.clone();
        let (memberships, messages) = self
            .db(move |s| Ok((s.list_memberships(&id)?, s.list_messages(&id)?)))
            .await?;
        Ok(ConversationSnapshot {
            conversation,
            memberships,
            messages,
        })
    }

    /// Media must exist, be listed once and not already belong to a message.
    /// Ownership and conversation are checked by the mutator.
    async fn resolve_medias(&self, media_ids: Vec<String>) -> SyncResult<Vec<MediaAttachment>> {
        if media_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = media_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(SyncError::invalid(format!("media {} listed twice", dup)));
        }

        let resolved = self
            .db(move |s| {
                media_ids
                    .into_iter()
                    .map(|id| {
                        let media = s.get_media(&id)?;
                        let attached = s.is_media_attached(&id)?;
                        Ok((id, media, attached))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .await?;

        resolved
            .into_iter()
            .map(|(id, media, attached)| match media {
                None => Err(SyncError::not_found(format!("media {}", id))),
                Some(_) if attached => Err(SyncError::invalid(format!(
                    "media {} is already attached to a message",
                    id
                ))),
                Some(media) => Ok(media),
            })
            .collect()
    }

    fn publish(&self, event: Option<DomainEvent>) {
        if let Some(event) = event {
            self.dispatcher.publish(event);
        }
    }
}

/// Store `outcome` only if the cycle that requested it is still the current
/// one. A later lock cycle supersedes this one.
fn settle_analysis(
    store: &dyn EntityStore,
    conversation_id: &str,
    requested_at: DateTime<Utc>,
    outcome: &AnalysisState,
) -> anyhow::Result<bool> {
    match store.get_analysis(conversation_id)? {
        Some(AnalysisState::Pending {
            requested_at: at, ..
        }) if at == requested_at => {
            store.save_analysis(conversation_id, outcome)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl From<SyncError> for Rejection {
    fn from(e: SyncError) -> Self {
        Rejection {
            code: e.code().to_string(),
            error: e.to_string(),
        }
    }
}

#[async_trait]
impl CommandHandler for Engine {
    async fn handle(
        &self,
        conversation_id: &str,
        user_id: &str,
        command: GatewayCommand,
    ) -> Result<(), Rejection> {
        let result = match command {
            GatewayCommand::PostMessage { content, media_ids } => self
                .post_message(conversation_id, user_id, content, media_ids)
                .await
                .map(drop),
            GatewayCommand::React { message_id, emoji } => self
                .react(conversation_id, &message_id, user_id, &emoji)
                .await
                .map(drop),
            GatewayCommand::Vote {
                message_id,
                votee_id,
            } => self
                .vote(conversation_id, &message_id, user_id, &votee_id)
                .await
                .map(drop),
        };
        result.map_err(|e| {
            debug!("{} command rejected in {}: {}", user_id, conversation_id, e);
            Rejection::from(e)
        })
    }
}
