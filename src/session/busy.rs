use std::sync::Arc;

use dashmap::DashSet;

use crate::error::{AppError, Result};

/// Per-conversation "generation in progress" flags, shared by all connections.
#[derive(Clone, Default)]
pub struct BusyRegistry {
    active: Arc<DashSet<String>>,
}

impl BusyRegistry {
    /// Sets the flag for `conversation_id`, or fails with `ConversationBusy`
    /// when it is already set. The flag clears when the guard drops.
    pub fn try_acquire(&self, conversation_id: &str) -> Result<BusyGuard> {
        if !self.active.insert(conversation_id.to_string()) {
            return Err(AppError::ConversationBusy(conversation_id.to_string()));
        }
        Ok(BusyGuard {
            active: self.active.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }

    #[must_use]
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.active.contains(conversation_id)
    }
}

#[must_use = "the busy flag is released as soon as the guard is dropped"]
pub struct BusyGuard {
    active: Arc<DashSet<String>>,
    conversation_id: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.active.remove(&self.conversation_id);
    }
}
