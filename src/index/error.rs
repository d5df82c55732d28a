use crate::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("meta.json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("query parse error: {0}")]
    QueryParse(String),

    #[error("timed out acquiring {0} after {1:?}")]
    LockTimeout(&'static str, std::time::Duration),

    #[error("index at {0} is corrupt: {1}")]
    Corrupt(String, String),

    #[error("operation refused on protected index {0}")]
    Protected(String),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::Tantivy(_) => ErrorKind::Critical,
            IndexError::Io(_) => ErrorKind::Recoverable,
            IndexError::Json(_) => ErrorKind::Critical,
            IndexError::QueryParse(_) => ErrorKind::Expected,
            IndexError::LockTimeout(_, _) => ErrorKind::Recoverable,
            IndexError::Corrupt(_, _) => ErrorKind::Critical,
            IndexError::Protected(_) => ErrorKind::Critical,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
