//! Entity-scoped retrieval-augmented research service core.
//!
//! This crate owns the three hard components of the service: the session
//! and task orchestrator ([`manager`]), the per-entity RAG registry
//! ([`entity_rag_manager`]), and the agent tool-calling loop
//! ([`agent::research_agent`]). Storage and the vector index live one layer
//! down, in `rag-store`; concrete LLM/embedder/chunker implementations live
//! one layer up, in `rag-providers`.

pub mod agent;
pub mod collaborators;
pub mod config;
pub mod cost;
pub mod entity_rag_manager;
pub mod error;
pub mod logging;
pub mod manager;
pub mod model;
pub mod session_lock;
pub mod worker_pool;

pub use collaborators::{ChunkedContent, Chunker, Embedder, FallbackChunker, HttpChunker};
pub use config::Config;
pub use entity_rag_manager::EntityRagManager;
pub use error::{Error, Result};
pub use manager::Manager;
pub use model::*;
