use rusqlite::Connection;

use crate::error::Result;

/// Initialise the narration-state table. One row per user; the UNIQUE
/// constraint plus lazy `INSERT OR IGNORE` creation keeps it that way.
/// Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS narration_state (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id  TEXT NOT NULL UNIQUE,

            intv_session_id               TEXT,
            intv_word_count               INTEGER NOT NULL DEFAULT 0,
            intv_expire_at                TEXT,
            intv_previous_response_id     TEXT,
            intv_previous_content         TEXT,
            intv_hint_id                  INTEGER,

            stn_session_id                TEXT,
            stn_word_count                INTEGER NOT NULL DEFAULT 0,
            stn_expire_at                 TEXT,
            stn_previous_response_id      TEXT,
            stn_unprocessed_overflow      TEXT,

            dir_session_id                TEXT,
            dir_word_count                INTEGER NOT NULL DEFAULT 0,
            dir_expire_at                 TEXT,
            dir_previous_response_id      TEXT,

            cache_pool                    TEXT
        );",
    )?;
    Ok(())
}
