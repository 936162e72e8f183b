//! Core data model: entities, documents, chunks, sessions, tasks and the
//! derived knowledge-graph view over chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A namespace isolating documents, chunks, a vector index, and chat
/// sessions. The id is client-supplied and reusable once an entity under it
/// has been soft-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub dir: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub documents_count: u64,
    #[serde(default)]
    pub chunk_count: u64,
    #[serde(default)]
    pub sessions_count: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    pub last_accessed: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub description: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// The id a soft-deleted record is re-inserted under.
    pub fn deleted_id(id: &str, at: DateTime<Utc>) -> String {
        format!("[DELETED]{id}_{}", at.to_rfc3339())
    }

    /// Regex matching any deleted variant of `id`, newest-first ordering is
    /// the caller's responsibility (sort by the trailing timestamp).
    pub fn deleted_id_pattern(id: &str) -> String {
        format!(r"^\[DELETED\]{}_", regex::escape(id))
    }
}

/// A document, possibly shared across entities via `entity_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub doc_name: String,
    pub doc_path: String,
    pub content_hash: String,
    pub file_size: u64,
    pub indexed_at: DateTime<Utc>,
    pub entity_ids: Vec<String>,
    pub metadata: Option<Value>,
}

/// A contiguous slice of a document's markdown representation, owned by
/// exactly one (entity, document) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub entity_id: String,
    pub chunk_order_index: usize,
    pub content: String,
    pub source: Option<String>,
    #[serde(default)]
    pub pages: Vec<u32>,
    pub tokens: Option<usize>,
    pub metadata: Option<Value>,
}

impl Chunk {
    pub fn id_for(doc_id: &str, chunk_order_index: usize) -> String {
        format!("chunk_{doc_id}_{chunk_order_index}")
    }
}

/// One turn in a session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub relationship_ids: Vec<String>,
    #[serde(default)]
    pub cited_node_ids: Vec<String>,
    #[serde(default)]
    pub services_used: Vec<crate::cost::Service>,
    pub estimated_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

/// A stateful chat with one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub session_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub entity_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Upload,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are terminal: once reached, a task record is
    /// never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// An asynchronous unit of work (upload or chat turn) with a terminal
/// status and a cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub entity_id: String,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    pub doc_id: Option<String>,
    pub chunks_count: Option<usize>,
    pub is_duplicate: Option<bool>,
    pub session_id: Option<String>,
    pub error_message: Option<String>,
}

/// A knowledge-graph node: one per chunk, addressed by composite id rather
/// than an in-memory reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub entity_id: String,
    pub doc_id: String,
    pub chunk_order_index: usize,
}

impl Node {
    pub fn id_for(entity_id: &str, doc_id: &str, chunk_order_index: usize) -> String {
        format!("{entity_id}_{doc_id}_{chunk_order_index}")
    }
}

/// An edge between two nodes used together in an answer, or adjacent within
/// a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub label: RelationshipLabel,
}

impl Relationship {
    pub fn id_for(source_node_id: &str, target_node_id: &str) -> String {
        format!("{source_node_id}:{target_node_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipLabel {
    Sequential,
    Reference,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_format() {
        assert_eq!(Chunk::id_for("D1", 3), "chunk_D1_3");
    }

    #[test]
    fn node_and_relationship_id_format() {
        let node = Node::id_for("e1", "D", 7);
        assert_eq!(node, "e1_D_7");
        let rel = Relationship::id_for("e1_D_7", "e1_D_8");
        assert_eq!(rel, "e1_D_7:e1_D_8");
    }

    #[test]
    fn task_status_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
