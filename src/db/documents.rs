use super::conversations::insert_main_conversation;
use super::{Db, models::*, new_id};
use chrono::Utc;
use rusqlite::{OptionalExtension, Result, params};

fn map_chunk_row(row: &rusqlite::Row<'_>) -> Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as usize,
        content: row.get(3)?,
        length: row.get::<_, i64>(4)? as usize,
    })
}

fn map_document_row(row: &rusqlite::Row<'_>) -> Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
    })
}

const CHUNK_COLUMNS: &str = "id, document_id, sequence, content, length";

impl Db {
    /// Stores a document, its chunks (sequence = slice index) and its main
    /// conversation in one transaction.
    pub fn insert_document(&mut self, title: &str, chunks: &[String]) -> Result<StoredDocument> {
        let tx = self.conn.transaction()?;
        let now = Utc::now();

        let document = Document {
            id: new_id(),
            title: title.to_string(),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO documents (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![document.id, document.title, document.created_at],
        )?;

        let mut stored = Vec::with_capacity(chunks.len());
        for (sequence, content) in chunks.iter().enumerate() {
            let chunk = Chunk {
                id: new_id(),
                document_id: document.id.clone(),
                sequence,
                content: content.clone(),
                length: content.chars().count(),
            };
            tx.execute(
                "INSERT INTO chunks (id, document_id, sequence, content, length) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.sequence as i64,
                    chunk.content,
                    chunk.length as i64
                ],
            )?;
            stored.push(chunk);
        }

        let main_conversation = insert_main_conversation(&tx, &document.id, now)?;

        tx.commit()?;
        Ok(StoredDocument {
            document,
            chunks: stored,
            main_conversation,
        })
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT id, title, created_at FROM documents WHERE id = ?1",
                params![id],
                map_document_row,
            )
            .optional()
    }

    /// Newest documents first.
    pub fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at FROM documents
             ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], map_document_row)?;
        rows.collect()
    }

    pub fn count_documents(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All chunks of a document, ordered by sequence.
    pub fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ?1 ORDER BY sequence"
        ))?;
        let rows = stmt.query_map(params![document_id], map_chunk_row)?;
        rows.collect()
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        self.conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"),
                params![id],
                map_chunk_row,
            )
            .optional()
    }

    pub fn get_chunk_by_sequence(&self, document_id: &str, sequence: usize) -> Result<Option<Chunk>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ?1 AND sequence = ?2"
                ),
                params![document_id, sequence as i64],
                map_chunk_row,
            )
            .optional()
    }

    pub fn count_chunks(&self, document_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_document_writes_everything() {
        let mut db = Db::open_in_memory().unwrap();
        let stored = db
            .insert_document("Paper", &texts(&["alpha", "beta", "gamma"]))
            .unwrap();

        assert_eq!(stored.chunks.len(), 3);
        assert_eq!(stored.main_conversation.kind, ConversationKind::Main);
        assert_eq!(stored.main_conversation.document_id, stored.document.id);

        let doc = db.get_document(&stored.document.id).unwrap().unwrap();
        assert_eq!(doc.title, "Paper");

        let chunks = db.list_chunks(&stored.document.id).unwrap();
        let sequences: Vec<usize> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(chunks[1].content, "beta");
        assert_eq!(chunks[1].length, 4);
    }

    #[test]
    fn test_chunk_lookups() {
        let mut db = Db::open_in_memory().unwrap();
        let stored = db.insert_document("Doc", &texts(&["one", "two"])).unwrap();
        let doc_id = &stored.document.id;

        let second = db.get_chunk_by_sequence(doc_id, 1).unwrap().unwrap();
        assert_eq!(second.content, "two");
        assert!(db.get_chunk_by_sequence(doc_id, 2).unwrap().is_none());

        let by_id = db.get_chunk(&second.id).unwrap().unwrap();
        assert_eq!(by_id, second);
        assert_eq!(db.count_chunks(doc_id).unwrap(), 2);
    }

    #[test]
    fn test_missing_document() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.get_document("nope").unwrap().is_none());
        assert_eq!(db.count_chunks("nope").unwrap(), 0);
    }

    #[test]
    fn test_list_documents_newest_first() {
        let mut db = Db::open_in_memory().unwrap();
        let first = db.insert_document("First", &texts(&["a"])).unwrap();
        let second = db.insert_document("Second", &texts(&["b"])).unwrap();
        let third = db.insert_document("Third", &texts(&["c"])).unwrap();

        let ids: Vec<String> = db
            .list_documents(10, 0)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![third.document.id, second.document.id.clone(), first.document.id]);

        let page = db.list_documents(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.document.id);
        assert!(db.list_documents(10, 3).unwrap().is_empty());
        assert_eq!(db.count_documents().unwrap(), 3);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let mut db = Db::open_in_memory().unwrap();
        let stored = db.insert_document("Doc", &texts(&["one"])).unwrap();
        let result = db.conn.execute(
            "INSERT INTO chunks (id, document_id, sequence, content, length) VALUES ('x', ?1, 0, 'dup', 3)",
            params![stored.document.id],
        );
        assert!(result.is_err());
    }
}
