//! Error taxonomy shared by every component.
//!
//! Validation failures go back to the immediate caller with a structured
//! detail and are never retried. Storage failures roll back and surface as
//! [`AppError::Storage`]. Generation failures during a stream become a
//! terminal error event.
use std::fmt;

use thiserror::Error;

use crate::generation::GenerationError;
use crate::ingest::IngestError;

/// Entity kinds that can be looked up by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Document,
    Chunk,
    Conversation,
    Message,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Document => "document",
            Entity::Chunk => "chunk",
            Entity::Conversation => "conversation",
            Entity::Message => "message",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    #[error("document has no chunks: {0}")]
    DocumentHasNoChunks(String),

    #[error("invalid range [{start}, {end}) for chunk of length {length}")]
    InvalidRange { start: i64, end: i64, length: usize },

    #[error("conversation already merged: {0}")]
    AlreadyMerged(String),

    #[error("conversation is busy generating a reply: {0}")]
    ConversationBusy(String),

    #[error("generation failed: {0}")]
    UpstreamGeneration(#[from] GenerationError),

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("ingestion failed: {0}")]
    Ingestion(#[from] IngestError),

    #[error("authentication required")]
    Unauthenticated,
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        AppError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    /// Stable snake_case code carried in error events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound { .. } => "not_found",
            AppError::DocumentHasNoChunks(_) => "document_has_no_chunks",
            AppError::InvalidRange { .. } => "invalid_range",
            AppError::AlreadyMerged(_) => "already_merged",
            AppError::ConversationBusy(_) => "conversation_busy",
            AppError::UpstreamGeneration(GenerationError::Cancelled) => "cancelled",
            AppError::UpstreamGeneration(_) => "upstream_generation_error",
            AppError::Validation(_) => "validation_error",
            AppError::Storage(_) => "storage_error",
            AppError::Ingestion(_) => "ingestion_error",
            AppError::Unauthenticated => "unauthenticated",
        }
    }

    /// The looked-up entity, for `NotFound` errors.
    #[must_use]
    pub fn missing_entity(&self) -> Option<Entity> {
        match self {
            AppError::NotFound { entity, .. } => Some(*entity),
            _ => None,
        }
    }
}
