//! Error types for the storage layer

use thiserror::Error;

/// Result type alias using [`StoreError`]
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid regex in query: {0}")]
    Regex(#[from] regex::Error),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("upsert requires a resolvable document id")]
    NoUpsertId,

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector index corrupt: {0}")]
    IndexCorrupt(String),
}
