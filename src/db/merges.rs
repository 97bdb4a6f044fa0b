use super::messages::insert_message;
use super::{Db, models::*};
use chrono::{DateTime, Utc};
use rusqlite::{Result, params};

impl Db {
    /// Flags the highlight conversation merged and appends `message` to the
    /// main conversation in one transaction.
    ///
    /// Returns `Ok(None)` without writing anything when the highlight is not an
    /// unmerged chunk conversation at commit time.
    pub fn commit_merge(
        &mut self,
        main_id: &str,
        highlight_id: &str,
        message: &NewMessage<'_>,
        merged_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let tx = self.conn.transaction()?;

        let flagged = tx.execute(
            "UPDATE conversations SET merged = 1, merged_into = ?1, merged_at = ?2 \
             WHERE id = ?3 AND kind = 'chunk' AND merged = 0",
            params![main_id, merged_at, highlight_id],
        )?;
        if flagged == 0 {
            return Ok(None);
        }

        let appended = insert_message(&tx, main_id, message, merged_at)?;
        tx.commit()?;
        Ok(Some(appended))
    }
}
