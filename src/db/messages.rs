use super::{Db, models::*, new_id};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result, params};

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, sequence, created_at, \
     source_conversation_id, highlight_start, highlight_end, highlighted_text";

fn map_message_row(row: &rusqlite::Row<'_>) -> Result<Message> {
    let source: Option<String> = row.get(6)?;
    let provenance = match source {
        Some(source_conversation_id) => Some(Provenance {
            source_conversation_id,
            highlight_range: HighlightRange {
                start: row.get::<_, i64>(7)? as usize,
                end: row.get::<_, i64>(8)? as usize,
            },
            highlighted_text: row.get(9)?,
        }),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        sequence: row.get::<_, i64>(4)? as usize,
        created_at: row.get(5)?,
        provenance,
    })
}

/// Appends one message with the next gap-free sequence number.
///
/// Callers run this inside a transaction so the sequence read and the
/// insert cannot interleave with another writer.
pub(crate) fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    message: &NewMessage<'_>,
    created_at: DateTime<Utc>,
) -> Result<Message> {
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence) + 1, 0) FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;

    let id = new_id();
    let provenance = message.provenance;
    conn.execute(
        r#"
        INSERT INTO messages
            (id, conversation_id, role, content, sequence, created_at,
             source_conversation_id, highlight_start, highlight_end, highlighted_text)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            id,
            conversation_id,
            message.role,
            message.content,
            sequence,
            created_at,
            provenance.map(|p| p.source_conversation_id.as_str()),
            provenance.map(|p| p.highlight_range.start as i64),
            provenance.map(|p| p.highlight_range.end as i64),
            provenance.map(|p| p.highlighted_text.as_str()),
        ],
    )?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        role: message.role,
        content: message.content.to_string(),
        sequence: sequence as usize,
        created_at,
        provenance: provenance.cloned(),
    })
}

impl Db {
    /// Appends messages in order, all or nothing.
    pub fn append_messages(
        &mut self,
        conversation_id: &str,
        messages: &[NewMessage<'_>],
    ) -> Result<Vec<Message>> {
        let tx = self.conn.transaction()?;
        let now = Utc::now();
        let mut appended = Vec::with_capacity(messages.len());
        for message in messages {
            appended.push(insert_message(&tx, conversation_id, message, now)?);
        }
        tx.commit()?;
        Ok(appended)
    }

    /// Messages ordered by sequence, optionally paginated.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
             ORDER BY sequence LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![conversation_id, limit, offset as i64],
            map_message_row,
        )?;
        rows.collect()
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
