//! Storyboard journal — the append-only log of graph deltas that doubles as
//! the cross-agent message bus. Two processed-cursors advance independently:
//! the Stenographer's and the Director's, each monotonic 0→1.

use memoir_core::{AgentRole, StoryKind};
use rusqlite::Transaction;
use tracing::debug;

use crate::error::Result;
use crate::store::Store;
use crate::types::StoryboardEntry;

impl Store {
    /// Rows not yet acknowledged by `role`, ascending by id.
    /// Only the Stenographer and Director carry a cursor.
    pub fn unprocessed_storyboard(
        &self,
        user_id: &str,
        role: AgentRole,
    ) -> Result<Vec<StoryboardEntry>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT story_id, user_id, story_type, entity_id, story_content,
                    stn_processed, dir_processed, created_at
             FROM storyboard
             WHERE user_id = ?1 AND {} = 0
             ORDER BY story_id ASC",
            cursor_column(role)
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![user_id], row_to_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The latest `n` rows regardless of cursor state, returned ascending.
    /// This is the cold-start context path used when an agent's provider
    /// session had to be rebuilt.
    pub fn latest_storyboard(&self, user_id: &str, n: usize) -> Result<Vec<StoryboardEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT story_id, user_id, story_type, entity_id, story_content,
                    stn_processed, dir_processed, created_at
             FROM storyboard
             WHERE user_id = ?1
             ORDER BY story_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, n as i64], row_to_entry)?;
        let mut out: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        out.reverse();
        Ok(out)
    }

    /// Flip `role`'s cursor on every row with id ≤ `max_story_id`.
    /// The flipped set is always a prefix of the id-ordered journal.
    pub fn mark_storyboard_processed(
        &self,
        user_id: &str,
        role: AgentRole,
        max_story_id: i64,
    ) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "UPDATE storyboard SET {col} = 1
             WHERE user_id = ?1 AND story_id <= ?2 AND {col} = 0",
            col = cursor_column(role)
        );
        let n = db.execute(&sql, rusqlite::params![user_id, max_story_id])?;
        debug!(user_id, role = %role, max_story_id, flipped = n, "storyboard cursor advanced");
        Ok(n)
    }

    /// Write one hint and flip the Director cursor in a single transaction,
    /// so a processed row always has the hint that acknowledged it.
    /// Returns the new hint id.
    pub fn insert_hint_and_mark(
        &self,
        user_id: &str,
        hint_content: &str,
        flip_up_to: Option<i64>,
    ) -> Result<i64> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO hints (user_id, hint_content, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, hint_content, now],
        )?;
        let hint_id = tx.last_insert_rowid();
        if let Some(max_id) = flip_up_to {
            tx.execute(
                "UPDATE storyboard SET dir_processed = 1
                 WHERE user_id = ?1 AND story_id <= ?2 AND dir_processed = 0",
                rusqlite::params![user_id, max_id],
            )?;
        }
        tx.commit()?;
        debug!(user_id, hint_id, ?flip_up_to, "hint recorded");
        Ok(hint_id)
    }
}

/// Append one journal row inside an open materialization transaction.
pub(crate) fn append_entry(
    tx: &Transaction<'_>,
    user_id: &str,
    kind: StoryKind,
    entity_id: i64,
    title: &str,
    summary: &str,
) -> rusqlite::Result<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    let content = format!("[{}:{}] {} | {}", kind.letter(), entity_id, title, summary);
    tx.execute(
        "INSERT INTO storyboard
         (user_id, story_type, entity_id, story_content, stn_processed, dir_processed, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
        rusqlite::params![user_id, kind.code(), entity_id, content, now],
    )?;
    Ok(tx.last_insert_rowid())
}

fn cursor_column(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Stenographer => "stn_processed",
        // The Interviewer never reads the journal; treat anything else as Dir.
        _ => "dir_processed",
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryboardEntry> {
    let type_code: i64 = row.get(2)?;
    let stn: i64 = row.get(5)?;
    let dir: i64 = row.get(6)?;
    Ok(StoryboardEntry {
        story_id: row.get(0)?,
        user_id: row.get(1)?,
        story_type: StoryKind::from_code(type_code).unwrap_or(StoryKind::Shot),
        entity_id: row.get(3)?,
        story_content: row.get(4)?,
        stn_processed: stn != 0,
        dir_processed: dir != 0,
        created_at: row.get(7)?,
    })
}
