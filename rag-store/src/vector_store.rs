//! Per-entity dense vector index with sidecar chunk/document records
//! (component B, `EntityVectorStore`).
//!
//! One instance owns exactly one entity's HNSW index plus its chunk and
//! document collections in the underlying [`Store`]. Nothing here ever
//! reaches across entity boundaries; isolation is structural, not a filter
//! applied at query time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, StoreError};
use crate::kvstore::Store;
use crate::update::Update;

/// A single pre-chunked, pre-embedded unit of content to index.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub chunk_order_index: usize,
    pub content: String,
    pub source: Option<String>,
    pub pages: Vec<u32>,
    pub tokens: Option<usize>,
    pub metadata: Option<Value>,
    pub embedding: Vec<f32>,
}

/// On-disk shape of a chunk record, as read back from the chunks collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
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
    /// Kept alongside the chunk so a rebuild-on-delete can repopulate the
    /// index without re-invoking the embedder.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl ChunkRecord {
    fn id_for(doc_id: &str, chunk_order_index: usize) -> String {
        format!("chunk_{doc_id}_{chunk_order_index}")
    }

    fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub before: Vec<ChunkRecord>,
    pub current: ChunkRecord,
    pub after: Vec<ChunkRecord>,
}

#[derive(Debug, Clone)]
pub struct AddDocumentResult {
    pub doc_id: String,
    pub entity_id: String,
    pub chunks_count: usize,
    pub is_duplicate: bool,
    pub estimated_cost_usd: f64,
}

/// Quantize a (roughly [-1, 1]-normalized) f32 embedding to u8.
fn quantize(vec: &[f32]) -> Vec<u8> {
    vec.iter()
        .map(|&x| ((x + 1.0) * 127.5).clamp(0.0, 255.0) as u8)
        .collect()
}

/// L2 squared distance over quantized vectors; order-equivalent to cosine
/// distance for normalized embeddings living on the unit hypersphere.
#[derive(Clone, Copy)]
struct DistU8L2;

impl Distance<u8> for DistU8L2 {
    fn eval(&self, a: &[u8], b: &[u8]) -> f32 {
        let mut sum_sq_diff = 0u32;
        for (&x, &y) in a.iter().zip(b.iter()) {
            let diff = if x > y { x - y } else { y - x };
            sum_sq_diff += (diff as u32) * (diff as u32);
        }
        sum_sq_diff as f32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    doc_id: String,
    chunk_order_index: usize,
    embedding: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

struct Index {
    entries: RwLock<Vec<IndexEntry>>,
    hnsw: RwLock<Hnsw<'static, u8, DistU8L2>>,
    dimension: usize,
    max_elements: usize,
    dirty: RwLock<bool>,
}

impl Index {
    fn new(dimension: usize, max_elements: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            hnsw: RwLock::new(Hnsw::new(16, max_elements.max(16), 16, 200, DistU8L2)),
            dimension,
            max_elements: max_elements.max(16),
            dirty: RwLock::new(false),
        }
    }

    fn add(&self, doc_id: &str, chunk_order_index: usize, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }
        let quantized = quantize(embedding);
        let mut entries = self.entries.write();
        let hnsw = self.hnsw.write();
        let idx = entries.len();
        hnsw.parallel_insert(&[(&quantized, idx)]);
        entries.push(IndexEntry {
            doc_id: doc_id.to_string(),
            chunk_order_index,
            embedding: quantized,
        });
        *self.dirty.write() = true;
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, doc_ids: &[String]) -> Result<Vec<(String, usize, f64)>> {
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }
        let entries = self.entries.read();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let filtered = !doc_ids.is_empty();
        let search_k = if filtered { (k * 3).max(100) } else { k };
        let ef_search = (search_k * 2).max(50);
        let quantized = quantize(query);
        let hnsw = self.hnsw.read();
        let neighbors = hnsw.search(&quantized, search_k, ef_search);

        let mut results = Vec::new();
        for neighbor in neighbors {
            if neighbor.d_id >= entries.len() {
                continue;
            }
            let entry = &entries[neighbor.d_id];
            if filtered && !doc_ids.iter().any(|d| d == &entry.doc_id) {
                continue;
            }
            let score = 1.0 / (1.0 + neighbor.distance as f64);
            results.push((entry.doc_id.clone(), entry.chunk_order_index, score));
            if results.len() >= k {
                break;
            }
        }
        Ok(results)
    }

    fn clear(&self) {
        self.entries.write().clear();
        *self.hnsw.write() = Hnsw::new(16, self.max_elements, 16, 200, DistU8L2);
        *self.dirty.write() = true;
    }

    fn save(&self, path: &Path) -> Result<()> {
        if !*self.dirty.read() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let entries = self.entries.read();
        let snapshot = IndexSnapshot {
            dimension: self.dimension,
            entries: entries.clone(),
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        bincode::serialize_into(&tmp, &snapshot)
            .map_err(|e| StoreError::IndexCorrupt(e.to_string()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        *self.dirty.write() = false;
        Ok(())
    }

    fn load(path: &Path, max_elements: usize) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let snapshot: IndexSnapshot = bincode::deserialize(&bytes)
            .map_err(|e| StoreError::IndexCorrupt(e.to_string()))?;
        let index = Self::new(snapshot.dimension, max_elements.max(snapshot.entries.len()));
        {
            let mut entries = index.entries.write();
            let hnsw = index.hnsw.write();
            for entry in snapshot.entries {
                let idx = entries.len();
                hnsw.parallel_insert(&[(&entry.embedding, idx)]);
                entries.push(entry);
            }
        }
        *index.dirty.write() = false;
        Ok(Some(index))
    }
}

/// One dense-vector index + sidecar records, scoped to exactly one entity.
pub struct EntityVectorStore {
    store: Arc<Store>,
    entity_id: String,
    entity_dir: PathBuf,
    index: Index,
    hash_index: RwLock<HashMap<String, String>>,
    /// Serializes `add_chunks_batch`'s dedup-check-through-hash_index-insert
    /// sequence so two concurrent uploads of identical content can't both
    /// pass the check before either has recorded its content hash.
    add_lock: tokio::sync::Mutex<()>,
}

impl EntityVectorStore {
    fn chunks_collection(&self) -> String {
        format!("chunks_{}", self.entity_id)
    }

    fn index_path(&self) -> PathBuf {
        self.entity_dir.join("vector_store").join("index.bin")
    }

    /// Open (or create) the vector store for `entity_id`, seeding the
    /// dedup hash map from every document this entity already owns.
    pub async fn open(
        store: Arc<Store>,
        entity_id: impl Into<String>,
        entity_dir: PathBuf,
        dimension: usize,
    ) -> Result<Self> {
        let entity_id = entity_id.into();
        std::fs::create_dir_all(entity_dir.join("vector_store"))?;

        let index_path = entity_dir.join("vector_store").join("index.bin");
        let index = Index::load(&index_path, 1000)?.unwrap_or_else(|| Index::new(dimension, 1000));

        let docs = store
            .find("documents", Some(&json!({"entity_ids": entity_id})))
            .await?;
        let mut hash_index = HashMap::new();
        for doc in &docs {
            if let (Some(hash), Some(doc_id)) = (
                doc.get("content_hash").and_then(Value::as_str),
                doc.get("doc_id").and_then(Value::as_str),
            ) {
                hash_index.insert(hash.to_string(), doc_id.to_string());
            }
        }

        Ok(Self {
            store,
            entity_id,
            entity_dir,
            index,
            hash_index: RwLock::new(hash_index),
            add_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Pre-lock dedup fast path: does this content hash already have a
    /// document in this entity? Returns the existing doc_id, if any.
    pub fn find_duplicate(&self, content_hash: &str) -> Option<String> {
        self.hash_index.read().get(content_hash).cloned()
    }

    /// Index a batch of already-chunked, already-embedded content under a
    /// fresh or existing `doc_id`. Used both for externally pre-chunked
    /// ingestion and as the primitive behind full-document ingestion.
    pub async fn add_chunks_batch(
        &self,
        doc_id: &str,
        doc_name: &str,
        doc_path: &str,
        content_hash: &str,
        file_size: u64,
        chunks: Vec<ChunkInput>,
        metadata: Option<Value>,
        estimated_cost_usd: f64,
    ) -> Result<AddDocumentResult> {
        // Held for the whole check-index-write-record sequence below so two
        // concurrent uploads of identical content can't both observe "no
        // existing doc" before either has inserted into hash_index.
        let _guard = self.add_lock.lock().await;

        if let Some(existing) = self.hash_index.read().get(content_hash).cloned() {
            return Ok(AddDocumentResult {
                doc_id: existing,
                entity_id: self.entity_id.clone(),
                chunks_count: 0,
                is_duplicate: true,
                estimated_cost_usd: 0.0,
            });
        }

        if chunks.is_empty() {
            return Err(StoreError::NotFound("chunker produced zero chunks".into()));
        }

        let collection = self.chunks_collection();
        for chunk in &chunks {
            self.index.add(doc_id, chunk.chunk_order_index, &chunk.embedding)?;
            let record = ChunkRecord {
                chunk_id: ChunkRecord::id_for(doc_id, chunk.chunk_order_index),
                doc_id: doc_id.to_string(),
                entity_id: self.entity_id.clone(),
                chunk_order_index: chunk.chunk_order_index,
                content: chunk.content.clone(),
                source: chunk.source.clone(),
                pages: chunk.pages.clone(),
                tokens: chunk.tokens,
                metadata: chunk.metadata.clone(),
                embedding: chunk.embedding.clone(),
            };
            self.store
                .update_one(
                    &collection,
                    &json!({"_id": record.chunk_id}),
                    &Update::new()
                        .set_on_insert("_id", record.chunk_id.clone())
                        .set_on_insert("chunk_id", record.chunk_id.clone())
                        .set("doc_id", record.doc_id.clone())
                        .set("entity_id", record.entity_id.clone())
                        .set("chunk_order_index", record.chunk_order_index as i64)
                        .set("content", record.content.clone())
                        .set("source", record.source.clone().map(Value::String).unwrap_or(Value::Null))
                        .set("pages", Value::Array(record.pages.iter().map(|p| json!(p)).collect()))
                        .set("tokens", record.tokens.map(|t| json!(t)).unwrap_or(Value::Null))
                        .set("metadata", record.metadata.clone().unwrap_or(Value::Null))
                        .set("embedding", Value::Array(record.embedding.iter().map(|v| json!(v)).collect())),
                    true,
                )
                .await?;
        }

        self.store
            .update_one(
                "documents",
                &json!({"doc_id": doc_id}),
                &Update::new()
                    .set_on_insert("doc_id", doc_id)
                    .set("doc_name", doc_name)
                    .set("doc_path", doc_path)
                    .set("content_hash", content_hash)
                    .set("file_size", file_size as i64)
                    .set_on_insert("indexed_at", Utc::now().to_rfc3339())
                    .add_to_set("entity_ids", self.entity_id.clone())
                    .set("metadata", metadata.unwrap_or(Value::Null)),
                true,
            )
            .await?;

        self.hash_index
            .write()
            .insert(content_hash.to_string(), doc_id.to_string());
        self.persist_index()?;

        Ok(AddDocumentResult {
            doc_id: doc_id.to_string(),
            entity_id: self.entity_id.clone(),
            chunks_count: chunks.len(),
            is_duplicate: false,
            estimated_cost_usd,
        })
    }

    pub async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        doc_ids: &[String],
    ) -> Result<Vec<ScoredChunk>> {
        let hits = self.index.search(query_embedding, k, doc_ids)?;
        let collection = self.chunks_collection();
        let mut out = Vec::with_capacity(hits.len());
        for (doc_id, chunk_order_index, score) in hits {
            let chunk_id = ChunkRecord::id_for(&doc_id, chunk_order_index);
            if let Some(doc) = self
                .store
                .find_one(&collection, &json!({"_id": chunk_id}))
                .await?
            {
                if let Some(chunk) = ChunkRecord::from_value(&doc) {
                    out.push(ScoredChunk { chunk, score });
                }
            }
        }
        Ok(out)
    }

    pub async fn get_chunk_by_id(&self, doc_id: &str, chunk_order_index: usize) -> Result<Option<ChunkRecord>> {
        let collection = self.chunks_collection();
        let chunk_id = ChunkRecord::id_for(doc_id, chunk_order_index);
        Ok(self
            .store
            .find_one(&collection, &json!({"_id": chunk_id}))
            .await?
            .and_then(|v| ChunkRecord::from_value(&v)))
    }

    pub async fn get_previous_chunk(&self, doc_id: &str, chunk_order_index: usize) -> Result<Option<ChunkRecord>> {
        if chunk_order_index == 0 {
            return Ok(None);
        }
        self.get_chunk_by_id(doc_id, chunk_order_index - 1).await
    }

    pub async fn get_next_chunk(&self, doc_id: &str, chunk_order_index: usize) -> Result<Option<ChunkRecord>> {
        self.get_chunk_by_id(doc_id, chunk_order_index + 1).await
    }

    pub async fn get_chunk_context(
        &self,
        doc_id: &str,
        chunk_order_index: usize,
        size: usize,
    ) -> Result<Option<ChunkContext>> {
        let Some(current) = self.get_chunk_by_id(doc_id, chunk_order_index).await? else {
            return Ok(None);
        };

        let mut before = Vec::new();
        for i in (0..chunk_order_index).rev().take(size) {
            if let Some(c) = self.get_chunk_by_id(doc_id, i).await? {
                before.push(c);
            }
        }
        before.reverse();

        let mut after = Vec::new();
        for i in (chunk_order_index + 1)..=(chunk_order_index + size) {
            match self.get_chunk_by_id(doc_id, i).await? {
                Some(c) => after.push(c),
                None => break,
            }
        }

        Ok(Some(ChunkContext { before, current, after }))
    }

    pub async fn get_chunk_neighbors(&self, doc_id: &str, chunk_order_index: usize, window: usize) -> Result<Vec<ChunkRecord>> {
        let ctx = self.get_chunk_context(doc_id, chunk_order_index, window).await?;
        Ok(match ctx {
            Some(c) => {
                let mut all = c.before;
                all.push(c.current);
                all.extend(c.after);
                all
            }
            None => Vec::new(),
        })
    }

    pub async fn get_document_chunks_in_order(&self, doc_id: &str) -> Result<Vec<ChunkRecord>> {
        let collection = self.chunks_collection();
        let mut chunks: Vec<ChunkRecord> = self
            .store
            .find(&collection, Some(&json!({"doc_id": doc_id})))
            .await?
            .iter()
            .filter_map(ChunkRecord::from_value)
            .collect();
        chunks.sort_by_key(|c| c.chunk_order_index);
        Ok(chunks)
    }

    pub async fn get_entity_documents(&self) -> Result<Vec<Value>> {
        self.store
            .find("documents", Some(&json!({"entity_ids": self.entity_id})))
            .await
    }

    /// Remove a document's chunks and ownership link; if it was the last
    /// owner, delete the document record. Always rebuilds the index from
    /// the surviving documents, since the underlying HNSW graph supports
    /// no in-place removal.
    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let collection = self.chunks_collection();
        self.store
            .delete_many(&collection, &json!({"doc_id": doc_id}))
            .await?;

        // Pull this entity out of the document's owner list; delete if orphaned.
        if let Some(doc) = self.store.find_one("documents", &json!({"doc_id": doc_id})).await? {
            let remaining: Vec<String> = doc
                .get("entity_ids")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .filter(|id| *id != self.entity_id)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            if remaining.is_empty() {
                self.store.delete_one("documents", &json!({"doc_id": doc_id})).await?;
            } else {
                self.store
                    .update_one(
                        "documents",
                        &json!({"doc_id": doc_id}),
                        &Update::new().set("entity_ids", Value::Array(remaining.into_iter().map(Value::String).collect())),
                        false,
                    )
                    .await?;
            }
        }

        self.hash_index.write().retain(|_, v| v != doc_id);
        self.rebuild_index().await
    }

    /// Re-materialize every surviving chunk's embedding from its sidecar
    /// record and rebuild the index from scratch. Chosen over in-place
    /// removal since the HNSW graph doesn't support it; expected to be rare.
    async fn rebuild_index(&self) -> Result<()> {
        self.index.clear();
        let collection = self.chunks_collection();
        let raw = self.store.find(&collection, None).await?;
        let mut chunks: Vec<ChunkRecord> = raw.iter().filter_map(ChunkRecord::from_value).collect();
        chunks.sort_by(|a, b| a.doc_id.cmp(&b.doc_id).then(a.chunk_order_index.cmp(&b.chunk_order_index)));

        for chunk in &chunks {
            if chunk.embedding.len() == self.index.dimension {
                self.index.add(&chunk.doc_id, chunk.chunk_order_index, &chunk.embedding)?;
            }
        }
        self.persist_index()?;
        Ok(())
    }

    fn persist_index(&self) -> Result<()> {
        self.index.save(&self.index_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vec(seed: u8, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| if i as u8 == seed % dim as u8 { 1.0 } else { -1.0 })
            .collect()
    }

    #[tokio::test]
    async fn add_and_search_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("storage")));
        let evs = EntityVectorStore::open(store, "e1", dir.path().join("entities/e1"), 8)
            .await
            .unwrap();

        let chunks = vec![ChunkInput {
            chunk_order_index: 0,
            content: "hello world".into(),
            source: None,
            pages: vec![],
            tokens: Some(2),
            metadata: None,
            embedding: unit_vec(0, 8),
        }];

        let result = evs
            .add_chunks_batch("D1", "hello.txt", "/uploads/hello.txt", "hash123", 11, chunks, None, 0.0)
            .await
            .unwrap();
        assert!(!result.is_duplicate);
        assert_eq!(result.chunks_count, 1);

        let hits = evs.search(&unit_vec(0, 8), 5, &[]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.doc_id, "D1");
    }

    #[tokio::test]
    async fn duplicate_upload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("storage")));
        let evs = EntityVectorStore::open(store, "e1", dir.path().join("entities/e1"), 4)
            .await
            .unwrap();

        let chunk = || {
            vec![ChunkInput {
                chunk_order_index: 0,
                content: "x".into(),
                source: None,
                pages: vec![],
                tokens: None,
                metadata: None,
                embedding: vec![1.0, -1.0, 1.0, -1.0],
            }]
        };

        evs.add_chunks_batch("D1", "a.txt", "/a.txt", "samehash", 1, chunk(), None, 0.0)
            .await
            .unwrap();
        let second = evs
            .add_chunks_batch("D2", "b.txt", "/b.txt", "samehash", 1, chunk(), None, 0.0)
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.doc_id, "D1");
    }

    #[tokio::test]
    async fn chunk_context_returns_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("storage")));
        let evs = EntityVectorStore::open(store, "e1", dir.path().join("entities/e1"), 4)
            .await
            .unwrap();

        let chunks = (0..3)
            .map(|i| ChunkInput {
                chunk_order_index: i,
                content: format!("chunk {i}"),
                source: None,
                pages: vec![],
                tokens: None,
                metadata: None,
                embedding: vec![1.0, -1.0, 1.0, -1.0],
            })
            .collect();

        evs.add_chunks_batch("D1", "doc.txt", "/doc.txt", "h1", 10, chunks, None, 0.0)
            .await
            .unwrap();

        let ctx = evs.get_chunk_context("D1", 1, 1).await.unwrap().unwrap();
        assert_eq!(ctx.before.len(), 1);
        assert_eq!(ctx.after.len(), 1);
        assert_eq!(ctx.current.chunk_order_index, 1);
    }
}
