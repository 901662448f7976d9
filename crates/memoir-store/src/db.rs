use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Open a connection to the shared database file.
///
/// Several subsystems each hold their own connection to the same file, so
/// WAL mode and a busy timeout are required for concurrent writers.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let _: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Initialise all tables owned by the store. Safe to call on every startup
/// (idempotent). The narration-state table is owned by `memoir-narration`
/// and initialised there.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_dialogue_tables(conn)?;
    create_graph_tables(conn)?;
    create_journal_tables(conn)?;
    create_telemetry_tables(conn)?;
    create_settings_tables(conn)?;
    Ok(())
}

fn create_dialogue_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS utterances (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            speaker     INTEGER NOT NULL,
            has_voice   INTEGER NOT NULL DEFAULT 0,
            text        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_utterances_user
            ON utterances(user_id, id DESC);

        CREATE TABLE IF NOT EXISTS voice_clips (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            speaker       INTEGER NOT NULL,
            utterance_id  INTEGER,
            url           TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_voice_clips_user
            ON voice_clips(user_id);",
    )?;
    Ok(())
}

fn create_graph_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            summary     TEXT,
            content     TEXT,
            start_time  TEXT,
            end_time    TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stages_user ON stages(user_id);

        CREATE TABLE IF NOT EXISTS topics (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          TEXT NOT NULL,
            parent_stage_id  INTEGER,
            title            TEXT NOT NULL,
            summary          TEXT,
            content          TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_topics_user ON topics(user_id);

        CREATE TABLE IF NOT EXISTS shots (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          TEXT NOT NULL,
            parent_topic_id  INTEGER,
            title            TEXT NOT NULL,
            summary          TEXT,
            content          TEXT,
            shot_type        INTEGER,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_shots_user ON shots(user_id);

        CREATE TABLE IF NOT EXISTS characters (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          TEXT NOT NULL,
            related_shot_id  INTEGER,
            name             TEXT NOT NULL,
            summary          TEXT,
            content          TEXT,
            relation         TEXT,
            evaluation       TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_characters_user ON characters(user_id);",
    )?;
    Ok(())
}

fn create_journal_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS storyboard (
            story_id       INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        TEXT NOT NULL,
            story_type     INTEGER NOT NULL,
            entity_id      INTEGER NOT NULL,
            story_content  TEXT NOT NULL,
            stn_processed  INTEGER NOT NULL DEFAULT 0,
            dir_processed  INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_storyboard_stn
            ON storyboard(user_id, stn_processed);
        CREATE INDEX IF NOT EXISTS idx_storyboard_dir
            ON storyboard(user_id, dir_processed);

        CREATE TABLE IF NOT EXISTS hints (
            hint_id       INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            hint_content  TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_hints_user
            ON hints(user_id, hint_id DESC);",
    )?;
    Ok(())
}

fn create_telemetry_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS llm_calls (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id            TEXT,
            agent              TEXT NOT NULL,
            model_id           INTEGER,
            api_model_id       TEXT NOT NULL,
            duration_ms        INTEGER,
            cost               REAL,
            total_tokens       INTEGER,
            prompt_tokens      INTEGER,
            completion_tokens  INTEGER,
            cached_tokens      INTEGER,
            created_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS asr_calls (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            utterance_id  INTEGER,
            model_id      INTEGER,
            duration_ms   INTEGER,
            cost          REAL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tts_calls (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            utterance_id   INTEGER,
            voice_clip_id  INTEGER,
            model_id       INTEGER,
            duration_ms    INTEGER,
            cost           REAL,
            created_at     TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_settings_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL,
            kind    TEXT NOT NULL,
            remark  TEXT
        );

        CREATE TABLE IF NOT EXISTS model_catalog (
            model_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            api_model_id    TEXT NOT NULL,
            price_in        REAL NOT NULL DEFAULT 0,
            price_out       REAL NOT NULL DEFAULT 0,
            cache_discount  REAL NOT NULL DEFAULT 0.5
        );

        CREATE TABLE IF NOT EXISTS prompts (
            prompt_id  INTEGER PRIMARY KEY AUTOINCREMENT,
            role       INTEGER NOT NULL,
            content    TEXT NOT NULL,
            active     INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use memoir_core::Speaker;

    #[test]
    fn two_connections_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memoir.db");
        let path = path.to_str().unwrap();

        let conn_a = open(path).unwrap();
        init_db(&conn_a).unwrap();
        let conn_b = open(path).unwrap();

        let a = Store::new(conn_a);
        let b = Store::new(conn_b);

        let id = a.insert_utterance("u-1", Speaker::User, false, "你好").unwrap();
        let seen = b.recent_dialogue("u-1", 10, 0).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, id);

        // Writers on both connections interleave without SQLITE_BUSY.
        b.insert_utterance("u-1", Speaker::Assistant, false, "你好呀").unwrap();
        a.insert_utterance("u-1", Speaker::User, false, "想聊聊").unwrap();
        assert_eq!(a.recent_dialogue("u-1", 10, 0).unwrap().len(), 3);
    }

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
