use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// A cache key that was looked up does not exist. Control-flow sentinel
    /// for the freshness protocol, never surfaced to operators.
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no database assigned")]
    NoDatabase,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("data store error: {0}")]
    DataStore(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}
