use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::error;

/// One async mutex per conversation id.
///
/// Every read-modify-write-publish sequence on a conversation runs under its
/// guard, which makes commands on the same conversation linearizable and
/// keeps publish order equal to commit order. Different conversations never
/// contend. Idle entries are pruned on the next acquire.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct ConversationGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => {
                    error!("conversation lock table poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            // Nobody but the table holds these, so nobody is waiting on them.
            locks.retain(|id, lock| id == conversation_id || Arc::strong_count(lock) > 1);
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        ConversationGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Conversations currently tracked, held or not.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
