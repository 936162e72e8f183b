//! Sharded JSON document store and per-entity vector index.
//!
//! `rag-store` implements the two lowest-level components of the research
//! service: a crash-safe, MongoDB-subset document store ([`kvstore::Store`],
//! component A) and a per-entity dense vector index with dedup and chunk
//! navigation ([`vector_store::EntityVectorStore`], component B). Neither
//! type knows about entities, sessions, or agents as concepts — those live
//! one layer up, in `rag-core`.

pub mod content_hash;
pub mod error;
pub mod kvstore;
pub mod query;
pub mod update;
pub mod vector_store;

pub use content_hash::hash_bytes;
pub use error::{Result, StoreError};
pub use kvstore::{Stage, Store, UpdateResult};
pub use update::{Update, UpdateOp};
pub use vector_store::{AddDocumentResult, ChunkContext, ChunkInput, ChunkRecord, EntityVectorStore, ScoredChunk};
