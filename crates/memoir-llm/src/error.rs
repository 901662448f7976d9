use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Format(String),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("call deadline exceeded after {secs}s")]
    Deadline { secs: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the same call may succeed if simply issued again later.
    /// Provider 4xx responses (other than 429) are fatal for this call.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Http(_)
            | LlmError::Stream(_)
            | LlmError::Deadline { .. }
            | LlmError::Format(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Cancelled => false,
        }
    }
}
