use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable segment of a document's extracted text.
///
/// `length` counts chars, and highlight ranges index chars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence: usize,
    pub content: String,
    pub length: usize,
}

impl Chunk {
    /// Text covered by `range`, or `None` when the range falls outside the chunk.
    #[must_use]
    pub fn slice(&self, range: HighlightRange) -> Option<String> {
        if range.end > self.length || range.start >= range.end {
            return None;
        }
        Some(
            self.content
                .chars()
                .skip(range.start)
                .take(range.end - range.start)
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Main,
    Chunk,
}

impl ConversationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Main => "main",
            ConversationKind::Chunk => "chunk",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(ConversationKind::Main),
            "chunk" => Ok(ConversationKind::Chunk),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

impl ToSql for ConversationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ConversationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Half-open char range `[start, end)` inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighlightRange {
    pub start: usize,
    pub end: usize,
}

/// Range-scoped conversations are keyed by `(chunk_id, start, end)`.
/// Several conversations may share a key; they stay independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HighlightKey<'a> {
    pub chunk_id: &'a str,
    pub range: HighlightRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub document_id: String,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<HighlightRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted_text: Option<String>,
    pub merged: bool,
    pub merged_into: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.kind == ConversationKind::Main
    }

    #[must_use]
    pub fn highlight_key(&self) -> Option<HighlightKey<'_>> {
        match (&self.chunk_id, self.range) {
            (Some(chunk_id), Some(range)) => Some(HighlightKey { chunk_id, range }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(FromSqlError::Other(format!("unknown role: {other}").into())),
        }
    }
}

/// Where a merged message came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_conversation_id: String,
    pub highlight_range: HighlightRange,
    pub highlighted_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub sequence: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// A message about to be appended; the store assigns id and sequence.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub role: Role,
    pub content: &'a str,
    pub provenance: Option<&'a Provenance>,
}

impl<'a> NewMessage<'a> {
    pub fn new(role: Role, content: &'a str) -> Self {
        Self {
            role,
            content,
            provenance: None,
        }
    }
}

/// Everything ingestion writes in one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
    pub main_conversation: Conversation,
}
