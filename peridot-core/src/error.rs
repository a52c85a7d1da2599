use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("indexing already in progress")]
    IndexingInProgress,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<notify::Error> for EngineError {
    fn from(e: notify::Error) -> Self {
        EngineError::Watch(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
