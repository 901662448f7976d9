use std::sync::Mutex;

use memoir_core::Speaker;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{AsrCallRecord, Hint, LlmCallRecord, TtsCallRecord, Utterance};

/// Typed accessors over the relational store: dialogue transcript, memoir
/// graph, storyboard journal, hints, and telemetry.
///
/// Thread-safe: wraps a single SQLite connection in a `Mutex`. Subsystems
/// that need their own transactional scope (narration state, settings) hold
/// their own connections to the same file.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    // -- dialogue transcript -------------------------------------------------

    /// Persist one turn-half. Returns the new utterance id.
    pub fn insert_utterance(
        &self,
        user_id: &str,
        speaker: Speaker,
        has_voice: bool,
        text: &str,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO utterances (user_id, speaker, has_voice, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, speaker.code(), has_voice, text, now],
        )?;
        let id = db.last_insert_rowid();
        debug!(user_id, speaker = %speaker.tag(), chars = text.chars().count(), id, "utterance stored");
        Ok(id)
    }

    /// The most recent `limit` utterances after skipping the newest `skip`,
    /// returned oldest first. Used to rebuild the rolling dialogue summary
    /// when a fresh provider session is opened.
    pub fn recent_dialogue(&self, user_id: &str, limit: usize, skip: usize) -> Result<Vec<Utterance>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, speaker, has_voice, text, created_at
             FROM utterances
             WHERE user_id = ?1
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![user_id, limit as i64, skip as i64],
            row_to_utterance,
        )?;
        let mut out: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        out.reverse();
        Ok(out)
    }

    /// Persist a voice blob URL linked to an utterance. Returns the clip id.
    pub fn insert_voice_clip(
        &self,
        user_id: &str,
        speaker: Speaker,
        utterance_id: Option<i64>,
        url: &str,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO voice_clips (user_id, speaker, utterance_id, url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, speaker.code(), utterance_id, url, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    // -- hints ---------------------------------------------------------------

    /// The most recent hint for a user, if any.
    pub fn latest_hint(&self, user_id: &str) -> Result<Option<Hint>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT hint_id, user_id, hint_content, created_at
             FROM hints
             WHERE user_id = ?1
             ORDER BY hint_id DESC
             LIMIT 1",
            rusqlite::params![user_id],
            row_to_hint,
        ) {
            Ok(h) => Ok(Some(h)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -- telemetry -----------------------------------------------------------
    //
    // Telemetry is never on a hot path: a failed write is logged, not raised.

    pub fn record_llm_call(&self, rec: &LlmCallRecord) {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let result = db.execute(
            "INSERT INTO llm_calls
             (user_id, agent, model_id, api_model_id, duration_ms, cost,
              total_tokens, prompt_tokens, completion_tokens, cached_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                rec.user_id,
                rec.agent.key(),
                rec.model_id,
                rec.api_model_id,
                rec.duration_ms,
                rec.cost,
                rec.total_tokens,
                rec.prompt_tokens,
                rec.completion_tokens,
                rec.cached_tokens,
                now,
            ],
        );
        if let Err(e) = result {
            warn!(agent = %rec.agent, error = %e, "failed to record LLM call");
        }
    }

    pub fn record_asr_call(&self, rec: &AsrCallRecord) {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let result = db.execute(
            "INSERT INTO asr_calls (utterance_id, model_id, duration_ms, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![rec.utterance_id, rec.model_id, rec.duration_ms, rec.cost, now],
        );
        if let Err(e) = result {
            warn!(error = %e, "failed to record ASR call");
        }
    }

    pub fn record_tts_call(&self, rec: &TtsCallRecord) {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let result = db.execute(
            "INSERT INTO tts_calls
             (utterance_id, voice_clip_id, model_id, duration_ms, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                rec.utterance_id,
                rec.voice_clip_id,
                rec.model_id,
                rec.duration_ms,
                rec.cost,
                now,
            ],
        );
        if let Err(e) = result {
            warn!(error = %e, "failed to record TTS call");
        }
    }
}

pub(crate) fn row_to_utterance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Utterance> {
    let speaker_code: i64 = row.get(2)?;
    Ok(Utterance {
        id: row.get(0)?,
        user_id: row.get(1)?,
        speaker: Speaker::from_code(speaker_code).unwrap_or(Speaker::User),
        has_voice: row.get(3)?,
        text: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn row_to_hint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Hint> {
    Ok(Hint {
        hint_id: row.get(0)?,
        user_id: row.get(1)?,
        hint_content: row.get(2)?,
        created_at: row.get(3)?,
    })
}
