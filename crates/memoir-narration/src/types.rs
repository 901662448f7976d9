use chrono::{DateTime, Duration, Utc};
use memoir_core::AgentRole;

/// The rolling dialogue summary is a bounded tail buffer — oldest characters
/// are evicted when appends push it past this cap.
pub const PREVIOUS_CONTENT_MAX_CHARS: usize = 5_000;

/// One agent's provider-side session, as persisted.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    pub session_id: Option<String>,
    pub word_count: i64,
    pub expire_at: Option<DateTime<Utc>>,
    pub previous_response_id: Option<String>,
}

/// The word/wall-clock budget a session must stay inside to be reused.
#[derive(Debug, Clone, Copy)]
pub struct SessionBudget {
    pub word_limit: i64,
    pub expire_duration_secs: i64,
    pub expire_buffer_secs: i64,
}

impl SessionSlot {
    /// A session is reusable iff it has an id, its word count is within the
    /// limit (the limit itself is still fine), and strictly more than the
    /// safety buffer remains before expiry.
    pub fn is_valid(&self, budget: &SessionBudget, now: DateTime<Utc>) -> bool {
        if self.session_id.is_none() {
            return false;
        }
        if self.word_count > budget.word_limit {
            return false;
        }
        match self.expire_at {
            Some(expire_at) => expire_at - now > Duration::seconds(budget.expire_buffer_secs),
            None => false,
        }
    }
}

/// Per-user narration state — exactly one row per user, created lazily on
/// the first Interviewer turn and never destroyed.
#[derive(Debug, Clone, Default)]
pub struct NarrationState {
    pub user_id: String,
    pub intv: SessionSlot,
    pub stn: SessionSlot,
    pub dir: SessionSlot,
    /// Rolling short summary of recent dialogue (Interviewer only).
    pub previous_content: Option<String>,
    /// Id of the last hint the Interviewer folded into a turn.
    pub consumed_hint_id: Option<i64>,
    /// Input preserved from a failed Stenographer run, retried with the next
    /// batch (Stenographer only).
    pub unprocessed_overflow: Option<String>,
    /// Dialogue delta since the last Stenographer snapshot.
    pub cache_pool: Option<String>,
}

impl NarrationState {
    pub fn slot(&self, role: AgentRole) -> &SessionSlot {
        match role {
            AgentRole::Interviewer => &self.intv,
            AgentRole::Stenographer => &self.stn,
            AgentRole::Director => &self.dir,
        }
    }
}

/// Keep the last `max_chars` characters of `s`.
pub(crate) fn tail_chars(s: &str, max_chars: usize) -> &str {
    let total = s.chars().count();
    if total <= max_chars {
        return s;
    }
    let skip = total - max_chars;
    match s.char_indices().nth(skip) {
        Some((byte_idx, _)) => &s[byte_idx..],
        None => s,
    }
}
