use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The shared store could not be reached or rejected a command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An atomic transaction did not commit. None of its effects applied.
    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for QuizError {
    fn from(error: redis::RedisError) -> Self {
        QuizError::StoreUnavailable(error.to_string())
    }
}

impl QuizError {
    /// Whether the failure came from the shared store rather than the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            QuizError::StoreUnavailable(_) | QuizError::Transaction(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QuizError>;
