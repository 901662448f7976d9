use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] memoir_store::StoreError),

    #[error(transparent)]
    Narration(#[from] memoir_narration::NarrationError),

    #[error(transparent)]
    Llm(#[from] memoir_llm::LlmError),

    #[error("extraction payload malformed: {0}")]
    Malformed(String),

    #[error("client channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, AgentError>;
