//! Chunk navigation derived purely from chunk sequence numbers.
use serde::Serialize;

use crate::db::SharedDb;
use crate::db::models::Chunk;
use crate::error::{AppError, Entity, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbors {
    pub prev: Option<Chunk>,
    pub next: Option<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkNavigation {
    pub current: Chunk,
    pub navigation: Neighbors,
}

#[derive(Clone)]
pub struct NavigationIndex {
    db: SharedDb,
}

impl NavigationIndex {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// The chunk and its neighbors at `sequence - 1` and `sequence + 1`.
    pub async fn navigate(&self, document_id: &str, chunk_id: &str) -> Result<ChunkNavigation> {
        let db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        if db.count_chunks(document_id)? == 0 {
            return Err(AppError::DocumentHasNoChunks(document_id.to_string()));
        }

        let current = db
            .get_chunk(chunk_id)?
            .filter(|c| c.document_id == document_id)
            .ok_or_else(|| AppError::not_found(Entity::Chunk, chunk_id))?;

        let prev = match current.sequence.checked_sub(1) {
            Some(seq) => db.get_chunk_by_sequence(document_id, seq)?,
            None => None,
        };
        let next = db.get_chunk_by_sequence(document_id, current.sequence + 1)?;

        Ok(ChunkNavigation {
            current,
            navigation: Neighbors { prev, next },
        })
    }
}
