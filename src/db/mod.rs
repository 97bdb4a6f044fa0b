//! Record store backed by SQLite.
//!
//! Documents and chunks are written once by ingestion. Conversations are
//! never deleted, messages are append-only. Every multi-row write (ingestion,
//! turn commit, merge) runs in a single transaction.
use rusqlite::{Connection, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;

pub mod conversations;
pub mod documents;
pub mod merges;
pub mod messages;
pub mod models;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    sequence INTEGER NOT NULL CHECK (sequence >= 0),
    content TEXT NOT NULL,
    length INTEGER NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id),
    UNIQUE (document_id, sequence)
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('main', 'chunk')),
    chunk_id TEXT,
    range_start INTEGER,
    range_end INTEGER,
    highlighted_text TEXT,
    merged INTEGER NOT NULL DEFAULT 0,
    merged_into TEXT,
    merged_at DATETIME,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id),
    FOREIGN KEY (chunk_id) REFERENCES chunks(id),
    CHECK (
        (kind = 'main' AND chunk_id IS NULL AND merged = 0)
        OR (kind = 'chunk' AND chunk_id IS NOT NULL
            AND range_start >= 0 AND range_end > range_start)
    )
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_main_per_document
    ON conversations(document_id) WHERE kind = 'main';
CREATE INDEX IF NOT EXISTS idx_conversation_document ON conversations(document_id);
CREATE INDEX IF NOT EXISTS idx_conversation_highlight
    ON conversations(chunk_id, range_start, range_end);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
    content TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    created_at DATETIME NOT NULL,
    source_conversation_id TEXT,
    highlight_start INTEGER,
    highlight_end INTEGER,
    highlighted_text TEXT,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    UNIQUE (conversation_id, sequence)
);
"#;

/// Handle shared between the HTTP surface and every session.
pub type SharedDb = Arc<TokioMutex<Db>>;

/// A wrapper around a SQLite connection initialized with the application schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        info!("journal mode: {mode}");
        let db = Self::init(conn)?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Wrap into the shared async handle.
    pub fn shared(self) -> SharedDb {
        Arc::new(TokioMutex::new(self))
    }
}

/// Fresh random id for any record.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
