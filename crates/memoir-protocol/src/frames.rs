use serde::{Deserialize, Serialize};

/// Client → Server: one spoken (or typed) turn.
/// Wire: `{ "user_id": "u-1", "text": "你好", "has_voice": true }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub has_voice: bool,
}

/// Server → Client streamed frames, one JSON object per message.
///
/// Per-connection ordering:
/// `session_id` ≺ `user_text_id` ≺ `start` ≺ interleaved `text`/`audio`
/// ≺ `text_finish`. `error` terminates the turn instead of `text_finish`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Issued at most once, immediately after the connection opens.
    SessionId { session_id: String },
    /// The persisted id of the user utterance that started this turn.
    UserTextId { text_id: i64 },
    /// The assistant reply stream begins.
    Start,
    /// One text delta, in provider order.
    Text { content: String },
    /// Base64 audio chunk for one rendered sentence.
    Audio { data: String },
    /// The assistant reply stream ended normally.
    TextFinish,
    /// Terminal error for this turn.
    Error { message: String },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
