use memoir_core::AgentRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("no model configured for agent {role}")]
    ModelNotConfigured { role: AgentRole },

    #[error("model {model_id} missing from the catalog")]
    ModelNotFound { model_id: i64 },

    #[error("no active prompt for agent {role}")]
    PromptMissing { role: AgentRole },
}

pub type Result<T> = std::result::Result<T, StoreError>;
