pub mod media;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use bourracho_types::models::{AnalysisState, Conversation, MediaAttachment, Membership, Message};

pub use memory::MemoryStore;

/// Typed CRUD access to conversations, memberships, messages and media.
///
/// Implementations hold no business rules. `Conversation::member_ids` is
/// always derived from the memberships in join order, so
/// `update_conversation` only persists name, owner and flags.
pub trait EntityStore: Send + Sync {
    // -- Conversations --

    /// Insert a conversation together with its first (owner) membership.
    fn insert_conversation(&self, conversation: &Conversation, owner: &Membership) -> Result<()>;
    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>>;
    fn update_conversation(&self, conversation: &Conversation) -> Result<()>;
    /// Persist the conversation and its analysis state atomically.
    fn update_conversation_and_analysis(
        &self,
        conversation: &Conversation,
        analysis: &AnalysisState,
    ) -> Result<()>;

    // -- Memberships --

    fn insert_membership(&self, membership: &Membership) -> Result<()>;
    fn update_membership(&self, membership: &Membership) -> Result<()>;
    /// Delete a membership and persist `conversation` (its owner may have
    /// changed) in one step. Fails if the user was not a member.
    fn remove_member(&self, conversation: &Conversation, user_id: &str) -> Result<()>;
    fn get_membership(&self, conversation_id: &str, user_id: &str) -> Result<Option<Membership>>;
    /// Memberships in join order.
    fn list_memberships(&self, conversation_id: &str) -> Result<Vec<Membership>>;

    // -- Messages --

    /// Insert a message and mark its media as attached.
    fn insert_message(&self, message: &Message) -> Result<()>;
    fn get_message(&self, id: &str) -> Result<Option<Message>>;
    /// Replace the mutable parts of a message (reacts and votes).
    fn update_message(&self, message: &Message) -> Result<()>;
    /// Messages ordered by (timestamp, id).
    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    // -- Media --

    fn insert_media(&self, media: &MediaAttachment) -> Result<()>;
    fn get_media(&self, id: &str) -> Result<Option<MediaAttachment>>;
    fn is_media_attached(&self, id: &str) -> Result<bool>;

    // -- Analyses --

    fn save_analysis(&self, conversation_id: &str, state: &AnalysisState) -> Result<()>;
    fn get_analysis(&self, conversation_id: &str) -> Result<Option<AnalysisState>>;

    /// Cheap liveness check for the detailed health endpoint.
    fn ping(&self) -> Result<()>;
}

/// SQLite-backed [`EntityStore`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::init(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&mut conn)
    }
}
