//! Error types for the research service core

use thiserror::Error;

/// Result type alias using the core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for entity orchestration, ingestion and the agent loop
#[derive(Debug, Error)]
pub enum Error {
    // ============ Not Found Errors ============
    /// Entity does not exist (or was soft-deleted)
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Document does not exist
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Chat session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Task does not exist
    #[error("task not found: {0}")]
    TaskNotFound(String),

    // ============ Conflict Errors ============
    /// Entity id already in use
    #[error("entity already exists: {0}")]
    EntityConflict(String),

    // ============ Validation Errors ============
    /// Chunk batch failed field validation
    #[error("validation error: {0}")]
    Validation(String),

    /// A pre-chunked batch referenced more than one doc_id
    #[error("chunk batch references mismatched doc_id: expected {expected}, got {got}")]
    MismatchedDocId { expected: String, got: String },

    // ============ Ingest Errors ============
    /// Chunker produced no usable content
    #[error("ingest error: {0}")]
    Ingest(String),

    /// Embedder unavailable or returned an error
    #[error("embedding error: {0}")]
    Embedding(String),

    // ============ Agent / Provider Errors ============
    /// LLM provider call failed
    #[error("provider error: {0}")]
    Provider(String),

    /// Tool invoked by the agent failed
    #[error("tool execution error: {tool_name} - {message}")]
    ToolExecution { tool_name: String, message: String },

    /// The agent could not parse a tool call's JSON arguments
    #[error("tool argument parse error for {tool_name}: {message}")]
    ToolArguments { tool_name: String, message: String },

    /// LLM stream ended or errored mid-turn
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // ============ Storage Errors ============
    /// Underlying document/vector store error
    #[error("storage error: {0}")]
    Store(#[from] rag_store::StoreError),

    // ============ Fatal Invariant Errors ============
    /// Chunk/vector sidecar divergence detected during a rebuild
    #[error("fatal invariant violated: {0}")]
    FatalInvariant(String),

    // ============ System Errors ============
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed (chunker polling, provider calls)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ============ Generic Errors ============
    /// Internal error that doesn't fit another category
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn ingest(msg: impl Into<String>) -> Self {
        Self::Ingest(msg.into())
    }

    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn tool_arguments(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolArguments {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Whether a caller may retry the operation that produced this error
    /// without first changing anything about the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StreamInterrupted(_) | Self::Http(_) | Self::Provider(_)
        )
    }

    /// Whether this error is categorically transient/IO, per the operator
    /// taxonomy distinguishing recoverable conditions from task-terminal ones.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Http(_) | Self::Store(_))
    }
}
