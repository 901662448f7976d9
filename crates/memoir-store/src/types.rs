use memoir_core::{AgentRole, Speaker, StoryKind};
use serde::Deserialize;

/// One half of a turn, as persisted.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: i64,
    pub user_id: String,
    pub speaker: Speaker,
    pub has_voice: bool,
    pub text: String,
    pub created_at: String,
}

/// One storyboard journal entry — a rendered one-line graph delta.
#[derive(Debug, Clone)]
pub struct StoryboardEntry {
    pub story_id: i64,
    pub user_id: String,
    pub story_type: StoryKind,
    pub entity_id: i64,
    pub story_content: String,
    pub stn_processed: bool,
    pub dir_processed: bool,
    pub created_at: String,
}

/// An advisory written by the Director and consumed at most once by the
/// Interviewer.
#[derive(Debug, Clone)]
pub struct Hint {
    pub hint_id: i64,
    pub user_id: String,
    pub hint_content: String,
    pub created_at: String,
}

/// A catalog row describing a callable model and its pricing.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub model_id: i64,
    pub name: String,
    pub api_model_id: String,
    /// Price per 1K prompt tokens.
    pub price_in: f64,
    /// Price per 1K completion tokens.
    pub price_out: f64,
    /// Multiplier applied to `price_in` for provider-cached prompt tokens.
    pub cache_discount: f64,
}

/// Per-agent tunables assembled from the settings table, with defaults for
/// anything not seeded.
#[derive(Debug, Clone)]
pub struct RoleTunables {
    pub role: AgentRole,
    pub model: ModelEntry,
    pub temperature: f64,
    pub word_limit: i64,
    pub expire_duration_secs: i64,
    pub expire_buffer_secs: i64,
}

/// One LLM telemetry row. Written after every gateway call; never on the
/// hot path — a failed write is logged and dropped.
#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub user_id: Option<String>,
    pub agent: AgentRole,
    pub model_id: Option<i64>,
    pub api_model_id: String,
    pub duration_ms: i64,
    pub cost: f64,
    pub total_tokens: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct AsrCallRecord {
    pub utterance_id: Option<i64>,
    pub model_id: Option<i64>,
    pub duration_ms: i64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct TtsCallRecord {
    pub utterance_id: Option<i64>,
    pub voice_clip_id: Option<i64>,
    pub model_id: Option<i64>,
    pub duration_ms: i64,
    pub cost: f64,
}

// ---------------------------------------------------------------------------
// Extraction payload — the shape the Stenographer model emits.
//
// Sections are keyed S/T/O/C/R and processed in that order so later sections
// can reference earlier ones by temp id ("s1", "t2", "o3", "c1"). The `pt`
// tag marks an item as new ("n") or an update ("u").
// ---------------------------------------------------------------------------

fn default_pt() -> String {
    "n".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionDelta {
    #[serde(rename = "S", default)]
    pub stages: Vec<StageItem>,
    #[serde(rename = "T", default)]
    pub topics: Vec<TopicItem>,
    #[serde(rename = "O", default)]
    pub shots: Vec<ShotItem>,
    #[serde(rename = "C", default)]
    pub characters: Vec<CharacterItem>,
    #[serde(rename = "R", default)]
    pub relations: Vec<RelationItem>,
}

impl ExtractionDelta {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
            && self.topics.is_empty()
            && self.shots.is_empty()
            && self.characters.is_empty()
            && self.relations.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageItem {
    #[serde(default = "default_pt")]
    pub pt: String,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicItem {
    #[serde(default = "default_pt")]
    pub pt: String,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Parent stage reference — a temp id, or a literal db id as a string.
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShotItem {
    #[serde(default = "default_pt")]
    pub pt: String,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub shot_type: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterItem {
    #[serde(default = "default_pt")]
    pub pt: String,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Related shot reference.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub evaluation: Option<String>,
}

/// A `link`/`unlink` edit to a parent pointer. `src` must be a temp-id-shaped
/// reference so its table can be inferred from the prefix; `tgt` may be a
/// temp id or a literal db id, and is absent for `unlink`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub src: String,
    #[serde(default)]
    pub tgt: Option<String>,
}
