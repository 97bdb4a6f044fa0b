//! Document store: ingestion entry point and read access to documents and chunks.
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::db::SharedDb;
use crate::db::models::{Chunk, Document, StoredDocument};
use crate::error::{AppError, Entity, Result};
use crate::ingest::{IngestError, IngestionService};

/// Page size used when a listing names none.
pub const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub document: Document,
    pub chunk_count: usize,
}

#[derive(Clone)]
pub struct DocumentStore {
    db: SharedDb,
}

impl DocumentStore {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Extracts and chunks `bytes` on a blocking thread, then stores the
    /// document, its chunks and its main conversation in one transaction.
    pub async fn ingest(
        &self,
        ingestor: Arc<dyn IngestionService>,
        bytes: Vec<u8>,
        filename: String,
    ) -> Result<StoredDocument> {
        let ingested = tokio::task::spawn_blocking(move || ingestor.ingest(&bytes, &filename))
            .await
            .map_err(|e| IngestError::Extraction(format!("ingestion task failed: {e}")))??;

        let mut db = self.db.lock().await;
        let stored = db.insert_document(&ingested.title, &ingested.chunks)?;
        info!(
            "Stored document {} ('{}', {} chunks, main conversation {})",
            stored.document.id,
            stored.document.title,
            stored.chunks.len(),
            stored.main_conversation.id
        );
        Ok(stored)
    }

    pub async fn get(&self, document_id: &str) -> Result<Document> {
        let db = self.db.lock().await;
        db.get_document(document_id)?
            .ok_or_else(|| AppError::not_found(Entity::Document, document_id))
    }

    /// Newest first. `limit` defaults to [`DEFAULT_PAGE_SIZE`] and is capped.
    pub async fn list(&self, limit: Option<usize>, offset: usize) -> Result<DocumentPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let db = self.db.lock().await;
        Ok(DocumentPage {
            documents: db.list_documents(limit, offset)?,
            total: db.count_documents()?,
        })
    }

    pub async fn metadata(&self, document_id: &str) -> Result<DocumentMetadata> {
        let db = self.db.lock().await;
        let document = db
            .get_document(document_id)?
            .ok_or_else(|| AppError::not_found(Entity::Document, document_id))?;
        Ok(DocumentMetadata {
            chunk_count: db.count_chunks(document_id)?,
            document,
        })
    }

    /// Chunks in sequence order.
    pub async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        Ok(db.list_chunks(document_id)?)
    }

    /// A chunk that belongs to `document_id`. A chunk of another document is
    /// reported as not found.
    pub async fn chunk(&self, document_id: &str, chunk_id: &str) -> Result<Chunk> {
        let db = self.db.lock().await;
        if db.get_document(document_id)?.is_none() {
            return Err(AppError::not_found(Entity::Document, document_id));
        }
        db.get_chunk(chunk_id)?
            .filter(|c| c.document_id == document_id)
            .ok_or_else(|| AppError::not_found(Entity::Chunk, chunk_id))
    }
}
