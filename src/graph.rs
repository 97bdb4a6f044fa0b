//! Conversation graph: the main conversation and highlight-scoped chunk
//! conversations of each document.
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::db::SharedDb;
use crate::db::conversations::ConversationFilter;
use crate::db::models::{Conversation, ConversationKind, HighlightRange};
use crate::error::{AppError, Entity, Result};

/// Chunk conversations of one chunk, ordered by range.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkConversations {
    pub chunk_id: String,
    pub sequence: usize,
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationListing {
    pub main: Conversation,
    /// Only chunks that have conversations, in chunk order.
    pub chunks: Vec<ChunkConversations>,
}

impl ConversationListing {
    /// Every conversation keyed by id.
    #[must_use]
    pub fn by_id(&self) -> BTreeMap<&str, &Conversation> {
        std::iter::once(&self.main)
            .chain(self.chunks.iter().flat_map(|c| c.conversations.iter()))
            .map(|c| (c.id.as_str(), c))
            .collect()
    }

    /// Number of conversations, main included.
    #[must_use]
    pub fn count(&self) -> usize {
        1 + self.chunks.iter().map(|c| c.conversations.len()).sum::<usize>()
    }
}

#[derive(Clone)]
pub struct ConversationGraph {
    db: SharedDb,
}

impl ConversationGraph {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Returns the document's main conversation, creating it only if none exists.
    pub async fn create_main(&self, document_id: &str) -> Result<Conversation> {
        let mut db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        let (main, created) = db.ensure_main_conversation(document_id)?;
        if created {
            info!("Created main conversation {} for document {document_id}", main.id);
        }
        Ok(main)
    }

    /// Creates a conversation scoped to `[start, end)` of a chunk.
    ///
    /// The stored highlighted text is always the chunk slice. A supplied
    /// `highlighted_text` must match it exactly.
    pub async fn create_chunk_conversation(
        &self,
        document_id: &str,
        chunk_id: &str,
        start: i64,
        end: i64,
        highlighted_text: Option<&str>,
    ) -> Result<Conversation> {
        let db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        let chunk = db
            .get_chunk(chunk_id)?
            .filter(|c| c.document_id == document_id)
            .ok_or_else(|| AppError::not_found(Entity::Chunk, chunk_id))?;

        let invalid = AppError::InvalidRange {
            start,
            end,
            length: chunk.length,
        };
        if start < 0 || end <= start || end as u64 > chunk.length as u64 {
            return Err(invalid);
        }
        let range = HighlightRange {
            start: start as usize,
            end: end as usize,
        };
        let slice = chunk.slice(range).ok_or(invalid)?;

        if let Some(given) = highlighted_text {
            if given != slice {
                return Err(AppError::validation(format!(
                    "highlighted_text does not match chunk content at [{start}, {end})"
                )));
            }
        }

        let conversation = db.insert_chunk_conversation(document_id, chunk_id, range, &slice)?;
        info!(
            "Created chunk conversation {} on chunk {} [{}, {})",
            conversation.id, chunk_id, range.start, range.end
        );
        Ok(conversation)
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Conversation> {
        let db = self.db.lock().await;
        db.get_conversation(conversation_id)?
            .ok_or_else(|| AppError::not_found(Entity::Conversation, conversation_id))
    }

    /// The main conversation plus all chunk conversations grouped by chunk.
    pub async fn list_for_document(&self, document_id: &str) -> Result<ConversationListing> {
        let mut db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        let (main, _) = db.ensure_main_conversation(document_id)?;

        let filter = ConversationFilter {
            kind: Some(ConversationKind::Chunk),
            ..Default::default()
        };
        let conversations = db.list_conversations(document_id, Some(&filter))?;
        let sequences: BTreeMap<String, usize> = db
            .list_chunks(document_id)?
            .into_iter()
            .map(|c| (c.id, c.sequence))
            .collect();

        // Rows arrive ordered by chunk sequence, so groups are contiguous.
        let mut chunks: Vec<ChunkConversations> = Vec::new();
        for conversation in conversations {
            // Main rows and malformed chunk rows carry no highlight key.
            let Some(chunk_id) = conversation.highlight_key().map(|k| k.chunk_id.to_string()) else {
                continue;
            };
            match chunks.last_mut() {
                Some(group) if group.chunk_id == chunk_id => group.conversations.push(conversation),
                _ => chunks.push(ChunkConversations {
                    sequence: sequences.get(&chunk_id).copied().unwrap_or_default(),
                    chunk_id,
                    conversations: vec![conversation],
                }),
            }
        }

        Ok(ConversationListing { main, chunks })
    }
}
