//! Owns every entity's vector store and the shared embedder (component C,
//! `EntityRAGManager`).
//!
//! A single instance is shared across the process (threaded through
//! [`crate::manager::Manager`] rather than held as a global static). The
//! store registry is a `tokio::sync::Mutex` guarding a
//! `HashMap<String, Arc<EntityVectorStore>>`, since
//! [`EntityRagManager::get_entity_store`] is invoked from request-serving
//! async tasks and may need to `.await` the store's construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rag_store::{AddDocumentResult, EntityVectorStore, ScoredChunk, Store};
use tokio::sync::Mutex;

use crate::collaborators::{Chunker, Embedder};
use crate::cost::{self, Service, ServiceType};
use crate::error::{Error, Result};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of embedding and indexing a whole file through the chunker.
pub struct AddDocumentOutcome {
    pub doc_id: String,
    pub chunks_count: usize,
    pub is_duplicate: bool,
    pub estimated_cost_usd: f64,
}

/// Process-wide registry of per-entity vector stores plus the embedder and
/// chunker every store shares.
pub struct EntityRagManager {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<dyn Chunker>,
    entities_dir: PathBuf,
    dimension: usize,
    registry: Mutex<HashMap<String, Arc<EntityVectorStore>>>,
}

impl EntityRagManager {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
        chunker: Arc<dyn Chunker>,
        entities_dir: PathBuf,
    ) -> Self {
        let dimension = embedder.dimension();
        Self {
            store,
            embedder,
            chunker,
            entities_dir,
            dimension,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn default_entity_dir(&self, entity_id: &str) -> PathBuf {
        self.entities_dir.join(entity_id)
    }

    /// Return the cached store for `entity_id`, or lazily construct one
    /// rooted at `dir` (or this manager's default layout if `dir` is
    /// absent).
    pub async fn get_entity_store(
        &self,
        entity_id: &str,
        dir: Option<PathBuf>,
    ) -> Result<Arc<EntityVectorStore>> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(entity_id) {
            return Ok(existing.clone());
        }

        let entity_dir = dir.unwrap_or_else(|| self.default_entity_dir(entity_id));
        let store = EntityVectorStore::open(
            self.store.clone(),
            entity_id.to_string(),
            entity_dir,
            self.dimension,
        )
        .await?;
        let store = Arc::new(store);
        registry.insert(entity_id.to_string(), store.clone());
        Ok(store)
    }

    /// Evict an entity's store from the cache. On-disk data is untouched;
    /// the next [`Self::get_entity_store`] call reopens it.
    pub async fn cleanup_entity(&self, entity_id: &str) {
        self.registry.lock().await.remove(entity_id);
    }

    /// Chunk (via the configured [`Chunker`], which degrades to fixed-size
    /// windowing on its own when the upstream service is unavailable), embed,
    /// and index one file under `entity_id`.
    pub async fn add_document(
        &self,
        entity_id: &str,
        entity_dir: Option<PathBuf>,
        bytes: &[u8],
        doc_name: &str,
        doc_path: &str,
        source: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(AddDocumentOutcome, Vec<Service>)> {
        let content_hash = rag_store::hash_bytes(bytes);
        let store = self.get_entity_store(entity_id, entity_dir).await?;

        // Pre-lock fast path: avoid chunking/embedding entirely on a known dup.
        if let Some(existing) = store.find_duplicate(&content_hash) {
            return Ok((
                AddDocumentOutcome {
                    doc_id: existing,
                    chunks_count: 0,
                    is_duplicate: true,
                    estimated_cost_usd: 0.0,
                },
                Vec::new(),
            ));
        }

        let raw_chunks = self.chunker.chunk(bytes, source).await?;
        if raw_chunks.is_empty() {
            return Err(Error::ingest("chunker produced zero chunks"));
        }

        let texts: Vec<String> = raw_chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed_many(&texts)
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;
        if embeddings.len() != raw_chunks.len() {
            return Err(Error::Embedding("embedder returned mismatched vector count".into()));
        }

        let embed_service = Service {
            service_type: ServiceType::Transformer,
            breakdown: serde_json::json!({"chunks": raw_chunks.len(), "model": "embedder"}),
            estimated_cost_usd: 0.0,
        };

        let chunk_inputs: Vec<rag_store::ChunkInput> = raw_chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let tokens = cost::estimate_tokens_from_content(&chunk.content) as usize;
                rag_store::ChunkInput {
                    chunk_order_index: chunk.chunk_order_index,
                    content: chunk.content,
                    source: chunk.source,
                    pages: Vec::new(),
                    tokens: Some(tokens),
                    metadata: chunk.metadata,
                    embedding,
                }
            })
            .collect();

        let doc_id = format!("doc_{}", uuid::Uuid::new_v4().simple());
        let result: AddDocumentResult = store
            .add_chunks_batch(
                &doc_id,
                doc_name,
                doc_path,
                &content_hash,
                bytes.len() as u64,
                chunk_inputs,
                metadata,
                0.0,
            )
            .await?;

        Ok((
            AddDocumentOutcome {
                doc_id: result.doc_id,
                chunks_count: result.chunks_count,
                is_duplicate: result.is_duplicate,
                estimated_cost_usd: result.estimated_cost_usd,
            },
            vec![embed_service],
        ))
    }

    /// Submit `(entity_id, file_bytes)` uploads for concurrent processing, one
    /// `spawn_blocking`-backed task per document, bounded by a 5-minute
    /// timeout each. Failures are captured per-document and never propagate
    /// to siblings.
    pub async fn add_documents_parallel(
        self: &Arc<Self>,
        jobs: Vec<(String, Vec<u8>, String, String)>,
    ) -> HashMap<String, Result<AddDocumentOutcome>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (entity_id, bytes, doc_name, doc_path) in jobs {
            let manager = self.clone();
            handles.push(async move {
                let key = format!("{entity_id}:{doc_path}");
                let outcome = tokio::time::timeout(
                    UPLOAD_TIMEOUT,
                    manager.add_document(&entity_id, None, &bytes, &doc_name, &doc_path, None, None),
                )
                .await;
                let result = match outcome {
                    Ok(Ok((outcome, _services))) => Ok(outcome),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(Error::Internal("upload timed out after 5 minutes".into())),
                };
                (key, result)
            });
        }

        let results = futures::future::join_all(handles).await;
        results.into_iter().collect()
    }

    /// Fan out a search across `entity_ids` concurrently, each bounded by a
    /// 30s timeout. A missing/timed-out entity contributes an empty result
    /// list rather than failing the whole call.
    pub async fn search_multiple_entities(
        &self,
        entity_ids: &[String],
        query_embedding: &[f32],
        k: usize,
    ) -> HashMap<String, Vec<ScoredChunk>> {
        let searches = entity_ids.iter().map(|entity_id| async move {
            let store = match self.get_entity_store(entity_id, None).await {
                Ok(s) => s,
                Err(_) => return (entity_id.clone(), Vec::new()),
            };
            let hits = tokio::time::timeout(SEARCH_TIMEOUT, store.search(query_embedding, k, &[]))
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();
            (entity_id.clone(), hits)
        });

        futures::future::join_all(searches).await.into_iter().collect()
    }

    /// Drain in-flight work and drop every cached store. There is no
    /// dedicated thread pool owned by this manager (uploads ride on Tokio's
    /// blocking pool), so shutdown is just a cache clear.
    pub async fn shutdown(&self) {
        self.registry.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct OneHotEmbedder {
        dimension: usize,
    }

    #[async_trait]
    impl Embedder for OneHotEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let hot = text.bytes().map(|b| b as usize).sum::<usize>() % self.dimension;
            let mut v = vec![-1.0f32; self.dimension];
            v[hot] = 1.0;
            Ok(v)
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    struct WholeFileChunker;

    #[async_trait]
    impl Chunker for WholeFileChunker {
        async fn chunk(&self, bytes: &[u8], source: Option<&str>) -> Result<Vec<crate::collaborators::ChunkedContent>> {
            Ok(vec![crate::collaborators::ChunkedContent {
                content: String::from_utf8_lossy(bytes).to_string(),
                chunk_order_index: 0,
                source: source.map(str::to_string),
                metadata: None,
            }])
        }
    }

    struct AlwaysFailsChunker;

    #[async_trait]
    impl Chunker for AlwaysFailsChunker {
        async fn chunk(&self, _bytes: &[u8], _source: Option<&str>) -> Result<Vec<crate::collaborators::ChunkedContent>> {
            Err(Error::ingest("chunker exploded"))
        }
    }

    fn build_manager(chunker: Arc<dyn Chunker>) -> (Arc<EntityRagManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("storage")));
        let entities_dir = dir.path().join("entities");
        std::fs::create_dir_all(&entities_dir).unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(OneHotEmbedder { dimension: 8 });
        let manager = Arc::new(EntityRagManager::new(store, embedder, chunker, entities_dir));
        (manager, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_documents_parallel_indexes_every_distinct_document() {
        let (manager, _dir) = build_manager(Arc::new(WholeFileChunker));
        let jobs: Vec<(String, Vec<u8>, String, String)> = (0..6)
            .map(|i| {
                (
                    "e1".to_string(),
                    format!("document body number {i}").into_bytes(),
                    format!("doc{i}.txt"),
                    format!("/uploads/doc{i}.txt"),
                )
            })
            .collect();

        let results = manager.add_documents_parallel(jobs).await;
        assert_eq!(results.len(), 6);
        for (key, result) in &results {
            let outcome = result.as_ref().unwrap_or_else(|err| panic!("{key} failed: {err}"));
            assert!(!outcome.is_duplicate);
            assert_eq!(outcome.chunks_count, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_documents_parallel_isolates_a_failing_sibling() {
        let (manager, _dir) = build_manager(Arc::new(AlwaysFailsChunker));
        let jobs = vec![
            ("e1".to_string(), b"body a".to_vec(), "a.txt".to_string(), "/a.txt".to_string()),
            ("e1".to_string(), b"body b".to_vec(), "b.txt".to_string(), "/b.txt".to_string()),
        ];

        let results = manager.add_documents_parallel(jobs).await;
        assert_eq!(results.len(), 2);
        // Every chunker call fails with AlwaysFailsChunker and raw_chunks is
        // empty, so add_document surfaces Error::Ingest for each job without
        // one failing call poisoning the other's independent task.
        for result in results.values() {
            assert!(result.is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn search_multiple_entities_returns_empty_for_unknown_entity() {
        let (manager, _dir) = build_manager(Arc::new(WholeFileChunker));
        manager
            .add_document("e1", None, b"revenue grew", "r.txt", "/r.txt", None, None)
            .await
            .unwrap();

        let results = manager
            .search_multiple_entities(&["e1".to_string(), "missing".to_string()], &vec![1.0; 8], 5)
            .await;

        assert_eq!(results.len(), 2);
        assert!(!results["e1"].is_empty());
        assert!(results["missing"].is_empty());
    }
}
