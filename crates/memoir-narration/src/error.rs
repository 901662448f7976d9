use thiserror::Error;

#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("no narration state for user {user_id}")]
    NotFound { user_id: String },
}

pub type Result<T> = std::result::Result<T, NarrationError>;
