use super::{Db, models::*, new_id};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Result, params};

/// Optional predicates for [`Db::list_conversations`].
#[derive(Debug, Default)]
pub struct ConversationFilter<'a> {
    pub kind: Option<ConversationKind>,
    pub chunk_id: Option<&'a str>,
    pub merged: Option<bool>,
}

const CONVERSATION_COLUMNS: &str = "c.id, c.document_id, c.kind, c.chunk_id, c.range_start, \
     c.range_end, c.highlighted_text, c.merged, c.merged_into, c.merged_at, c.created_at";

fn map_conversation_row(row: &rusqlite::Row<'_>) -> Result<Conversation> {
    let start: Option<i64> = row.get(4)?;
    let end: Option<i64> = row.get(5)?;
    let range = match (start, end) {
        (Some(start), Some(end)) => Some(HighlightRange {
            start: start as usize,
            end: end as usize,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: row.get(0)?,
        document_id: row.get(1)?,
        kind: row.get(2)?,
        chunk_id: row.get(3)?,
        range,
        highlighted_text: row.get(6)?,
        merged: row.get(7)?,
        merged_into: row.get(8)?,
        merged_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Inserts the main conversation row. Fails on the unique index if one exists.
pub(crate) fn insert_main_conversation(
    conn: &Connection,
    document_id: &str,
    created_at: DateTime<Utc>,
) -> Result<Conversation> {
    let conversation = Conversation {
        id: new_id(),
        document_id: document_id.to_string(),
        kind: ConversationKind::Main,
        chunk_id: None,
        range: None,
        highlighted_text: None,
        merged: false,
        merged_into: None,
        merged_at: None,
        created_at,
    };
    conn.execute(
        "INSERT INTO conversations (id, document_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            conversation.id,
            conversation.document_id,
            conversation.kind,
            conversation.created_at
        ],
    )?;
    Ok(conversation)
}

fn find_main(conn: &Connection, document_id: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.document_id = ?1 AND c.kind = 'main'"
        ),
        params![document_id],
        map_conversation_row,
    )
    .optional()
}

impl Db {
    /// Returns the document's main conversation, creating it if absent.
    /// The boolean is `true` when a row was created.
    pub fn ensure_main_conversation(&mut self, document_id: &str) -> Result<(Conversation, bool)> {
        let tx = self.conn.transaction()?;
        if let Some(existing) = find_main(&tx, document_id)? {
            return Ok((existing, false));
        }
        let created = insert_main_conversation(&tx, document_id, Utc::now())?;
        tx.commit()?;
        Ok((created, true))
    }

    pub fn insert_chunk_conversation(
        &self,
        document_id: &str,
        chunk_id: &str,
        range: HighlightRange,
        highlighted_text: &str,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: new_id(),
            document_id: document_id.to_string(),
            kind: ConversationKind::Chunk,
            chunk_id: Some(chunk_id.to_string()),
            range: Some(range),
            highlighted_text: Some(highlighted_text.to_string()),
            merged: false,
            merged_into: None,
            merged_at: None,
            created_at: Utc::now(),
        };
        self.conn.execute(
            r#"
            INSERT INTO conversations
                (id, document_id, kind, chunk_id, range_start, range_end, highlighted_text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                conversation.id,
                conversation.document_id,
                conversation.kind,
                chunk_id,
                range.start as i64,
                range.end as i64,
                highlighted_text,
                conversation.created_at
            ],
        )?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id],
                map_conversation_row,
            )
            .optional()
    }

    /// Lists a document's conversations: main first, then chunk conversations
    /// ordered by chunk sequence and range.
    pub fn list_conversations(
        &self,
        document_id: &str,
        filter: Option<&ConversationFilter<'_>>,
    ) -> Result<Vec<Conversation>> {
        let mut query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
             LEFT JOIN chunks ch ON c.chunk_id = ch.id \
             WHERE c.document_id = ?"
        );
        let mut params: Vec<Value> = vec![Value::Text(document_id.to_string())];

        if let Some(f) = filter {
            if let Some(kind) = f.kind {
                query.push_str(" AND c.kind = ?");
                params.push(Value::Text(kind.as_str().to_string()));
            }
            if let Some(chunk_id) = f.chunk_id {
                query.push_str(" AND c.chunk_id = ?");
                params.push(Value::Text(chunk_id.to_string()));
            }
            if let Some(merged) = f.merged {
                query.push_str(" AND c.merged = ?");
                params.push(Value::Integer(i64::from(merged)));
            }
        }

        query.push_str(
            " ORDER BY c.kind = 'chunk', ch.sequence, c.range_start, c.range_end, c.created_at",
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), map_conversation_row)?;
        rows.collect()
    }
}
