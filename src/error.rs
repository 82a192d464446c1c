//! Error types for the ragdb retrieval engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cluster request timed out: {0}")]
    ClusterTimeout(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Index inconsistent: {0}")]
    IndexInconsistent(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Serialization(err.to_string())
    }
}
