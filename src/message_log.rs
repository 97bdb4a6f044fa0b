//! Append-only message log with all-or-nothing commits of generated turns.
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::SharedDb;
use crate::db::models::{Message, NewMessage, Role};
use crate::error::{AppError, Entity, Result};

/// A chat turn whose reply is still streaming. Dropping it discards the
/// buffered text; nothing is written until [`MessageLog::commit_turn`].
#[derive(Debug)]
pub struct PendingTurn {
    conversation_id: String,
    user_content: String,
    buffer: String,
}

impl PendingTurn {
    pub fn new(conversation_id: impl Into<String>, user_content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_content: user_content.into(),
            buffer: String::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn push_token(&mut self, token: &str) {
        self.buffer.push_str(token);
    }

    /// Seals the turn once the generator signalled completion.
    ///
    /// The persisted reply is the concatenation of the streamed tokens, so
    /// what the client assembled is exactly what is stored.
    pub fn complete(self, final_text: &str) -> CompletedTurn {
        if self.buffer != final_text {
            warn!(
                "conversation {}: final text differs from streamed tokens ({} vs {} bytes), keeping streamed text",
                self.conversation_id,
                final_text.len(),
                self.buffer.len()
            );
        }
        CompletedTurn {
            conversation_id: self.conversation_id,
            user_content: self.user_content,
            assistant_content: self.buffer,
        }
    }
}

/// A fully generated turn, ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTurn {
    pub conversation_id: String,
    pub user_content: String,
    pub assistant_content: String,
}

/// Both messages written by one committed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub user: Message,
    pub assistant: Message,
}

/// One page of a conversation's messages.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub total: usize,
}

#[derive(Clone)]
pub struct MessageLog {
    db: SharedDb,
}

impl MessageLog {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Appends one message with the next sequence number.
    pub async fn append(&self, conversation_id: &str, role: Role, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(AppError::validation("message content must not be empty"));
        }
        let mut db = self.db.lock().await;
        if db.get_conversation(conversation_id)?.is_none() {
            return Err(AppError::not_found(Entity::Conversation, conversation_id));
        }
        let mut appended = db.append_messages(conversation_id, &[NewMessage::new(role, content)])?;
        appended
            .pop()
            .ok_or_else(|| AppError::not_found(Entity::Message, conversation_id))
    }

    /// All messages ordered by sequence.
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self.page(conversation_id, None, 0).await?.messages)
    }

    pub async fn page(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<MessagePage> {
        let db = self.db.lock().await;
        if db.get_conversation(conversation_id)?.is_none() {
            return Err(AppError::not_found(Entity::Conversation, conversation_id));
        }
        Ok(MessagePage {
            conversation_id: conversation_id.to_string(),
            messages: db.list_messages(conversation_id, limit, offset)?,
            total: db.count_messages(conversation_id)?,
        })
    }

    /// Writes the user message and the assistant reply of a turn in one
    /// transaction.
    pub async fn commit_turn(&self, turn: CompletedTurn) -> Result<TurnRecord> {
        let mut db = self.db.lock().await;
        let mut written = db.append_messages(
            &turn.conversation_id,
            &[
                NewMessage::new(Role::User, &turn.user_content),
                NewMessage::new(Role::Assistant, &turn.assistant_content),
            ],
        )?;
        let (Some(assistant), Some(user)) = (written.pop(), written.pop()) else {
            return Err(AppError::not_found(Entity::Message, &turn.conversation_id));
        };
        debug!(
            "Committed turn in {} (sequences {}..={})",
            turn.conversation_id, user.sequence, assistant.sequence
        );
        Ok(TurnRecord { user, assistant })
    }
}
