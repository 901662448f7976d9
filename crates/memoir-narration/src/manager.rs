use std::sync::Mutex;

use chrono::{DateTime, Utc};
use memoir_core::{AgentRole, Speaker};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{NarrationError, Result};
use crate::types::{
    tail_chars, NarrationState, SessionBudget, SessionSlot, PREVIOUS_CONTENT_MAX_CHARS,
};

/// The single authority for per-user narration state: the three provider
/// session slots, the cache pool, and the hint pointer.
///
/// Thread-safe: wraps its own SQLite connection in a `Mutex`, so every
/// read-modify-write here is serialized against the row it touches and can
/// run inside one transaction.
pub struct NarrationManager {
    db: Mutex<Connection>,
}

impl NarrationManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Return the user's state, creating the row on first use.
    pub fn get_or_create(&self, user_id: &str) -> Result<NarrationState> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR IGNORE INTO narration_state (user_id) VALUES (?1)",
                rusqlite::params![user_id],
            )?;
        }
        self.get(user_id)?
            .ok_or_else(|| NarrationError::NotFound {
                user_id: user_id.to_string(),
            })
    }

    pub fn get(&self, user_id: &str) -> Result<Option<NarrationState>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT user_id,
                    intv_session_id, intv_word_count, intv_expire_at, intv_previous_response_id,
                    intv_previous_content, intv_hint_id,
                    stn_session_id, stn_word_count, stn_expire_at, stn_previous_response_id,
                    stn_unprocessed_overflow,
                    dir_session_id, dir_word_count, dir_expire_at, dir_previous_response_id,
                    cache_pool
             FROM narration_state WHERE user_id = ?1",
            rusqlite::params![user_id],
            row_to_state,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -- session lifecycle ---------------------------------------------------

    /// Evaluate the validity predicate for one agent's session right now.
    pub fn session_valid(
        &self,
        user_id: &str,
        role: AgentRole,
        budget: &SessionBudget,
    ) -> Result<bool> {
        let state = self.get_or_create(user_id)?;
        Ok(state.slot(role).is_valid(budget, Utc::now()))
    }

    /// Discard the provider session: null the id and previous response id,
    /// zero the word count, and start a fresh expiry window.
    pub fn reset(&self, user_id: &str, role: AgentRole, budget: &SessionBudget) -> Result<()> {
        let expire_at =
            (Utc::now() + chrono::Duration::seconds(budget.expire_duration_secs)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let key = role.key();
        db.execute(
            &format!(
                "UPDATE narration_state SET
                    {key}_session_id = NULL,
                    {key}_word_count = 0,
                    {key}_expire_at = ?2,
                    {key}_previous_response_id = NULL
                 WHERE user_id = ?1"
            ),
            rusqlite::params![user_id, expire_at],
        )?;
        debug!(user_id, role = %role, "session slot reset");
        Ok(())
    }

    /// Record a successful call: chain the response id and add to the word
    /// budget. The first response of a fresh session becomes its session id;
    /// the expiry window is only ever written by `reset`.
    pub fn advance(
        &self,
        user_id: &str,
        role: AgentRole,
        response_id: &str,
        word_delta: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let key = role.key();
        db.execute(
            &format!(
                "UPDATE narration_state SET
                    {key}_session_id = COALESCE({key}_session_id, ?2),
                    {key}_previous_response_id = ?2,
                    {key}_word_count = {key}_word_count + ?3
                 WHERE user_id = ?1"
            ),
            rusqlite::params![user_id, response_id, word_delta.max(0)],
        )?;
        Ok(())
    }

    // -- cache pool ----------------------------------------------------------

    /// Append one turn-half to the pool as `"U:{text} "` / `"I:{text} "` in a
    /// single update. Returns the resulting pool length in characters.
    pub fn append_cache_pool(&self, user_id: &str, speaker: Speaker, text: &str) -> Result<i64> {
        let entry = format!("{}:{} ", speaker.tag(), text.trim());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO narration_state (user_id) VALUES (?1)",
            rusqlite::params![user_id],
        )?;
        db.execute(
            "UPDATE narration_state
             SET cache_pool = COALESCE(cache_pool, '') || ?2
             WHERE user_id = ?1",
            rusqlite::params![user_id, entry],
        )?;
        let len: i64 = db.query_row(
            "SELECT LENGTH(COALESCE(cache_pool, '')) FROM narration_state WHERE user_id = ?1",
            rusqlite::params![user_id],
            |r| r.get(0),
        )?;
        Ok(len)
    }

    /// True once the pool has reached the configured threshold — the sole
    /// trigger for enqueueing a Stenographer run.
    pub fn pool_over_threshold(&self, user_id: &str, limit: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let len: i64 = db
            .query_row(
                "SELECT LENGTH(COALESCE(cache_pool, '')) FROM narration_state WHERE user_id = ?1",
                rusqlite::params![user_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        Ok(len >= limit)
    }

    /// Snapshot-and-clear, the only hand-off between Interviewer turns and
    /// Stenographer runs. In one transaction the pool is read, appended onto
    /// the unprocessed overflow, and nulled — so from the moment this commits
    /// the input is durable in the overflow regardless of how the run ends.
    ///
    /// Returns `(overflow_plus_pool, pool_chars)`, or `None` when the pool
    /// was empty. A store error leaves the pool untouched.
    pub fn take_cache_pool(&self, user_id: &str) -> Result<Option<(String, i64)>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let row: Option<(Option<String>, Option<String>)> = match tx.query_row(
            "SELECT cache_pool, stn_unprocessed_overflow
             FROM narration_state WHERE user_id = ?1",
            rusqlite::params![user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ) {
            Ok(r) => Some(r),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let Some((pool, overflow)) = row else {
            return Ok(None);
        };
        let Some(pool) = pool.filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let pool_chars = pool.chars().count() as i64;
        let combined = match overflow.filter(|o| !o.is_empty()) {
            Some(o) => format!("{o}{pool}"),
            None => pool,
        };
        tx.execute(
            "UPDATE narration_state
             SET stn_unprocessed_overflow = ?2, cache_pool = NULL
             WHERE user_id = ?1",
            rusqlite::params![user_id, combined],
        )?;
        tx.commit()?;

        debug!(user_id, pool_chars, total_chars = combined.chars().count(), "cache pool snapshot taken");
        Ok(Some((combined, pool_chars)))
    }

    /// Drop the stowed input after a fully successful Stenographer run.
    pub fn clear_overflow(&self, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE narration_state SET stn_unprocessed_overflow = NULL WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        Ok(())
    }

    // -- rolling dialogue summary --------------------------------------------

    /// Replace the rolling summary, keeping only the newest characters when
    /// the cap is exceeded.
    pub fn set_previous_content(&self, user_id: &str, content: &str) -> Result<()> {
        let bounded = tail_chars(content, PREVIOUS_CONTENT_MAX_CHARS);
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE narration_state SET intv_previous_content = ?2 WHERE user_id = ?1",
            rusqlite::params![user_id, bounded],
        )?;
        Ok(())
    }

    // -- hint pointer --------------------------------------------------------

    /// True iff a hint exists that the Interviewer has not yet consumed.
    pub fn hint_updated(&self, user_id: &str, latest_hint_id: Option<i64>) -> Result<bool> {
        let Some(latest) = latest_hint_id else {
            return Ok(false);
        };
        let state = self.get_or_create(user_id)?;
        Ok(state.consumed_hint_id != Some(latest))
    }

    /// Record that a hint was folded into a completed turn.
    pub fn consume_hint(&self, user_id: &str, hint_id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE narration_state SET intv_hint_id = ?2 WHERE user_id = ?1",
            rusqlite::params![user_id, hint_id],
        )?;
        Ok(())
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<NarrationState> {
    fn parse_instant(raw: Option<String>) -> Option<DateTime<Utc>> {
        raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    Ok(NarrationState {
        user_id: row.get(0)?,
        intv: SessionSlot {
            session_id: row.get(1)?,
            word_count: row.get(2)?,
            expire_at: parse_instant(row.get(3)?),
            previous_response_id: row.get(4)?,
        },
        previous_content: row.get(5)?,
        consumed_hint_id: row.get(6)?,
        stn: SessionSlot {
            session_id: row.get(7)?,
            word_count: row.get(8)?,
            expire_at: parse_instant(row.get(9)?),
            previous_response_id: row.get(10)?,
        },
        unprocessed_overflow: row.get(11)?,
        dir: SessionSlot {
            session_id: row.get(12)?,
            word_count: row.get(13)?,
            expire_at: parse_instant(row.get(14)?),
            previous_response_id: row.get(15)?,
        },
        cache_pool: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn manager() -> NarrationManager {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        NarrationManager::new(conn)
    }

    fn budget() -> SessionBudget {
        SessionBudget {
            word_limit: 20_000,
            expire_duration_secs: 3_600,
            expire_buffer_secs: 300,
        }
    }

    #[test]
    fn exactly_one_state_row_per_user() {
        let m = manager();
        m.get_or_create("u-1").unwrap();
        m.get_or_create("u-1").unwrap();
        m.append_cache_pool("u-1", Speaker::User, "你好").unwrap();

        let db = m.db.lock().unwrap();
        let n: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM narration_state WHERE user_id = 'u-1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn append_formats_and_counts_characters() {
        let m = manager();
        let len = m.append_cache_pool("u-1", Speaker::User, "你好").unwrap();
        assert_eq!(len, "U:你好 ".chars().count() as i64);

        let len = m
            .append_cache_pool("u-1", Speaker::Assistant, "很高兴认识你")
            .unwrap();
        let expected = "U:你好 I:很高兴认识你 ".chars().count() as i64;
        assert_eq!(len, expected);

        let state = m.get("u-1").unwrap().unwrap();
        assert_eq!(state.cache_pool.as_deref(), Some("U:你好 I:很高兴认识你 "));
    }

    #[test]
    fn pool_exactly_at_threshold_triggers() {
        let m = manager();
        // "U:abc " is 6 chars.
        m.append_cache_pool("u-1", Speaker::User, "abc").unwrap();
        assert!(m.pool_over_threshold("u-1", 6).unwrap());
        assert!(!m.pool_over_threshold("u-1", 7).unwrap());
    }

    #[test]
    fn take_stows_into_overflow_and_empties_the_pool() {
        let m = manager();
        m.append_cache_pool("u-1", Speaker::User, "小时候住四合院").unwrap();
        let (snapshot, pool_chars) = m.take_cache_pool("u-1").unwrap().unwrap();
        assert_eq!(snapshot, "U:小时候住四合院 ");
        assert_eq!(pool_chars, snapshot.chars().count() as i64);

        let state = m.get("u-1").unwrap().unwrap();
        assert!(state.cache_pool.is_none());
        assert_eq!(state.unprocessed_overflow.as_deref(), Some("U:小时候住四合院 "));

        // A later snapshot prepends the preserved overflow.
        m.append_cache_pool("u-1", Speaker::Assistant, "后来呢").unwrap();
        let (combined, _) = m.take_cache_pool("u-1").unwrap().unwrap();
        assert_eq!(combined, "U:小时候住四合院 I:后来呢 ");
    }

    #[test]
    fn take_on_empty_pool_returns_none_and_keeps_overflow() {
        let m = manager();
        m.append_cache_pool("u-1", Speaker::User, "x").unwrap();
        m.take_cache_pool("u-1").unwrap().unwrap();

        assert!(m.take_cache_pool("u-1").unwrap().is_none());
        let state = m.get("u-1").unwrap().unwrap();
        assert_eq!(state.unprocessed_overflow.as_deref(), Some("U:x "));

        m.clear_overflow("u-1").unwrap();
        let state = m.get("u-1").unwrap().unwrap();
        assert!(state.unprocessed_overflow.is_none());
    }

    #[test]
    fn reset_then_advance_opens_a_fresh_session() {
        let m = manager();
        m.get_or_create("u-1").unwrap();
        m.reset("u-1", AgentRole::Interviewer, &budget()).unwrap();

        let state = m.get("u-1").unwrap().unwrap();
        assert!(state.intv.session_id.is_none());
        assert_eq!(state.intv.word_count, 0);
        let expire_after_reset = state.intv.expire_at.unwrap();
        assert!(!state.intv.is_valid(&budget(), Utc::now())); // no id yet

        m.advance("u-1", AgentRole::Interviewer, "resp-aaa", 40).unwrap();
        m.advance("u-1", AgentRole::Interviewer, "resp-bbb", 25).unwrap();

        let state = m.get("u-1").unwrap().unwrap();
        // First response id names the session; later calls only chain.
        assert_eq!(state.intv.session_id.as_deref(), Some("resp-aaa"));
        assert_eq!(state.intv.previous_response_id.as_deref(), Some("resp-bbb"));
        assert_eq!(state.intv.word_count, 65);
        // Advance never moves the expiry window.
        assert_eq!(state.intv.expire_at.unwrap(), expire_after_reset);
        assert!(state.intv.is_valid(&budget(), Utc::now()));
    }

    #[test]
    fn session_slots_are_independent_per_role() {
        let m = manager();
        m.get_or_create("u-1").unwrap();
        m.reset("u-1", AgentRole::Stenographer, &budget()).unwrap();
        m.advance("u-1", AgentRole::Stenographer, "resp-stn", 10).unwrap();

        let state = m.get("u-1").unwrap().unwrap();
        assert!(state.intv.session_id.is_none());
        assert!(state.dir.session_id.is_none());
        assert_eq!(state.stn.session_id.as_deref(), Some("resp-stn"));
    }

    #[test]
    fn hint_pointer_consumes_once() {
        let m = manager();
        m.get_or_create("u-1").unwrap();

        assert!(!m.hint_updated("u-1", None).unwrap());
        assert!(m.hint_updated("u-1", Some(42)).unwrap());

        m.consume_hint("u-1", 42).unwrap();
        assert!(!m.hint_updated("u-1", Some(42)).unwrap());
        assert!(m.hint_updated("u-1", Some(43)).unwrap());
    }

    #[test]
    fn previous_content_keeps_only_the_tail() {
        let m = manager();
        m.get_or_create("u-1").unwrap();
        let long = "甲".repeat(PREVIOUS_CONTENT_MAX_CHARS + 7) + "结尾";
        m.set_previous_content("u-1", &long).unwrap();

        let state = m.get("u-1").unwrap().unwrap();
        let stored = state.previous_content.unwrap();
        assert_eq!(stored.chars().count(), PREVIOUS_CONTENT_MAX_CHARS);
        assert!(stored.ends_with("结尾"));
    }
}
