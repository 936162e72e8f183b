//! Entity/file/session/task lifecycle orchestration (component F, `Manager`).
//!
//! The single point of contact between request-serving code and every other
//! component: it resolves entities and sessions through the [`rag_store::Store`]
//! (component A), delegates ingestion to [`crate::entity_rag_manager::EntityRagManager`]
//! (component C) by way of [`crate::worker_pool::WorkerPool`] (component D),
//! serializes chat turns through [`crate::session_lock::SessionLockRegistry`]
//! (component E), and drives [`crate::agent::research_agent::ResearchAgent`]
//! (component G) for conversation turns.
//!
//! The per-session lock is held across the *entire* turn (user-message
//! append through assistant-message persist), not released mid-stream and
//! reacquired, so concurrent turns on the same session can never interleave
//! their history entries.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use rag_store::Store;

use crate::agent::message::Message;
use crate::agent::provider::Provider;
use crate::agent::research_agent::{ResearchAgent, ResponseEvent};
use crate::collaborators::Embedder;
use crate::entity_rag_manager::EntityRagManager;
use crate::error::{Error, Result};
use crate::model::{
    ConversationEntry, ConversationRole, Entity, Node, Relationship, RelationshipLabel, Session,
    Task, TaskStatus, TaskType,
};
use crate::session_lock::SessionLockRegistry;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
use rag_store::Update;

/// Outcome of [`Manager::ingest_chunks`].
#[derive(Debug, Clone, Copy)]
pub struct IngestResult {
    pub total: usize,
    pub indexed: usize,
    pub duplicate: usize,
}

/// One pre-chunked, pre-embedded unit handed to [`Manager::ingest_chunks`].
/// Unlike [`Manager::upload_file`], which chunks and embeds a whole file
/// through the configured [`crate::collaborators::Chunker`]/[`Embedder`],
/// this path accepts content that was already chunked and embedded
/// upstream.
#[derive(Debug, Clone)]
pub struct IngestChunkInput {
    pub doc_id: String,
    pub doc_name: String,
    pub doc_path: String,
    pub content_hash: String,
    pub file_size: u64,
    pub chunk_order_index: usize,
    pub content: String,
    pub source: Option<String>,
    pub metadata: Option<Value>,
    pub embedding: Vec<f32>,
}

/// Result of [`Manager::chat_session_converse`].
pub enum ConverseOutput {
    /// Each event as the agent produces it, terminated by exactly one
    /// [`crate::agent::research_agent::ResponseEventKind::Terminal`] event.
    Stream(tokio::sync::mpsc::Receiver<Result<ResponseEvent>>),
    /// The turn already ran to completion; only the terminal event is
    /// available.
    Complete(ResponseEvent),
}

pub struct Manager {
    store: Arc<Store>,
    rag_manager: Arc<EntityRagManager>,
    worker_pool: WorkerPool,
    session_locks: Arc<SessionLockRegistry<ResearchAgent>>,
    entity_creation_lock: tokio::sync::Mutex<()>,
    entities_dir: PathBuf,
    provider: Arc<dyn Provider>,
    embedder: Arc<dyn Embedder>,
    model: String,
    temperature: f64,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        rag_manager: Arc<EntityRagManager>,
        provider: Arc<dyn Provider>,
        embedder: Arc<dyn Embedder>,
        entities_dir: PathBuf,
        model: String,
        temperature: f64,
        worker_pool_config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            rag_manager,
            worker_pool: WorkerPool::new(worker_pool_config),
            session_locks: Arc::new(SessionLockRegistry::new()),
            entity_creation_lock: tokio::sync::Mutex::new(()),
            entities_dir,
            provider,
            embedder,
            model,
            temperature,
        }
    }

    /// Spawn the idle-session sweeper and the worker pool's CPU monitor.
    /// Call once at process startup.
    pub fn start_background_tasks(&self) {
        crate::session_lock::spawn_sweeper(self.session_locks.clone());
        self.worker_pool.spawn_cpu_monitor();
    }

    /// Drain in-flight uploads and drop every cached store/agent.
    pub async fn shutdown(&self) {
        self.worker_pool.shutdown();
        self.rag_manager.shutdown().await;
    }

    /// Evict cached agents idle longer than `timeout`, returning the evicted
    /// session ids. [`Self::start_background_tasks`] already runs this on a
    /// fixed schedule against [`crate::session_lock::SESSION_INACTIVITY_TIMEOUT`];
    /// this is the same operation exposed for an operator-triggered sweep or
    /// a test that can't wait out the real timeout.
    pub fn evict_idle_sessions(&self, timeout: std::time::Duration) -> Vec<String> {
        self.session_locks.sweep_idle(timeout)
    }

    fn entity_dir_path(&self, dir: &str) -> PathBuf {
        self.entities_dir.join(dir)
    }

    // ---- entities --------------------------------------------------------

    pub async fn create_entity(
        &self,
        id: &str,
        name: &str,
        description: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Entity> {
        let _guard = self.entity_creation_lock.lock().await;

        if self.store.find_one("entities", &json!({"_id": id})).await?.is_some() {
            return Err(Error::EntityConflict(id.to_string()));
        }

        let now = Utc::now();
        let dir = format!("{id}_{}", now.to_rfc3339());
        let entity_dir = self.entity_dir_path(&dir);
        std::fs::create_dir_all(&entity_dir)?;

        let entity = Entity {
            id: id.to_string(),
            name: name.to_string(),
            dir,
            created_at: now,
            documents_count: 0,
            chunk_count: 0,
            sessions_count: 0,
            estimated_cost_usd: 0.0,
            last_accessed: now,
            metadata,
            description,
            deleted_at: None,
        };

        self.store
            .update_one("entities", &json!({"_id": id}), &entity_update(&entity), true)
            .await?;
        Ok(entity)
    }

    /// Direct lookup, then a regex fallback over `[DELETED]{id}_*` variants
    /// returning the most recently deleted one.
    pub async fn get_entity(&self, id: &str, include_deleted: bool) -> Result<Entity> {
        if let Some(doc) = self.store.find_one("entities", &json!({"_id": id})).await? {
            let entity: Entity = serde_json::from_value(doc)?;
            if entity.deleted_at.is_some() && !include_deleted {
                return Err(Error::EntityNotFound(id.to_string()));
            }
            return Ok(entity);
        }

        if !include_deleted {
            return Err(Error::EntityNotFound(id.to_string()));
        }

        let pattern = Entity::deleted_id_pattern(id);
        let matches = self
            .store
            .find("entities", Some(&json!({"_id": {"$regex": pattern}})))
            .await?;
        let mut candidates: Vec<Entity> = matches
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        candidates.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        candidates.into_iter().next().ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        let docs = self.store.find("entities", None).await?;
        Ok(docs
            .into_iter()
            .filter_map(|d| serde_json::from_value::<Entity>(d).ok())
            .filter(|e| e.deleted_at.is_none())
            .collect())
    }

    /// Under the entity_creation_lock: move the record to `[DELETED]…`.
    /// Outside the lock: cascade-delete sessions and best-effort rename the
    /// on-disk directory, swallowing a rename failure as a warning.
    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        let (old_dir, deleted_id) = {
            let _guard = self.entity_creation_lock.lock().await;

            let doc = self
                .store
                .find_one("entities", &json!({"_id": id}))
                .await?
                .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
            let mut entity: Entity = serde_json::from_value(doc)?;
            if entity.deleted_at.is_some() {
                return Err(Error::EntityNotFound(id.to_string()));
            }

            let deleted_at = Utc::now();
            let deleted_id = Entity::deleted_id(id, deleted_at);
            let old_dir = entity.dir.clone();

            self.store.delete_one("entities", &json!({"_id": id})).await?;
            entity.id = deleted_id.clone();
            entity.deleted_at = Some(deleted_at);
            self.store
                .update_one("entities", &json!({"_id": deleted_id}), &entity_update(&entity), true)
                .await?;

            (old_dir, deleted_id)
        };

        self.rag_manager.cleanup_entity(id).await;

        let sessions = self.store.find("sessions", Some(&json!({"entity_id": id}))).await.unwrap_or_default();
        for doc in sessions {
            if let Some(session_id) = doc.get("_id").and_then(Value::as_str) {
                if let Err(err) = self.delete_chat_session(session_id).await {
                    tracing::warn!(%err, session_id, "failed to cascade-delete session on entity delete");
                }
            }
        }

        let old_path = self.entity_dir_path(&old_dir);
        let new_path = self.entities_dir.join(&deleted_id);
        if let Err(err) = std::fs::rename(&old_path, &new_path) {
            tracing::warn!(%err, entity_id = id, "failed to rename entity directory on delete");
        }

        Ok(())
    }

    // ---- uploads -----------------------------------------------------------

    /// Create a `pending` upload task and submit the work to the worker
    /// pool; the returned [`Task`] reflects the just-created pending state,
    /// not the eventual outcome.
    pub async fn upload_file(
        &self,
        entity_id: &str,
        file_bytes: Vec<u8>,
        doc_name: String,
        doc_path: String,
        source: Option<String>,
    ) -> Result<Task> {
        let entity = self.get_entity(entity_id, false).await?;
        let now = Utc::now();
        let task_id = format!("upload_{}", short_uuid());

        let task = Task {
            task_id: task_id.clone(),
            task_type: TaskType::Upload,
            status: TaskStatus::Pending,
            created_at: now,
            processing_started_at: None,
            completed_at: None,
            entity_id: entity_id.to_string(),
            estimated_cost_usd: 0.0,
            doc_id: None,
            chunks_count: None,
            is_duplicate: None,
            session_id: None,
            error_message: None,
        };
        self.store
            .update_one("tasks", &json!({"_id": task_id}), &task_update(&task), true)
            .await?;

        let store = self.store.clone();
        let rag_manager = self.rag_manager.clone();
        let entity_dir = self.entity_dir_path(&entity.dir);
        let entity_id = entity_id.to_string();
        let task_id_for_worker = task_id.clone();
        let handle = tokio::runtime::Handle::current();

        self.worker_pool.submit(move || {
            handle.block_on(run_upload_job(
                store,
                rag_manager,
                entity_id,
                entity_dir,
                task_id_for_worker,
                file_bytes,
                doc_name,
                doc_path,
                source,
            ));
        });

        Ok(task)
    }

    /// Synchronous batch ingest of already-chunked, already-embedded
    /// content. Skips chunks whose `chunk_id` already exists for this
    /// document; all chunks must share one `doc_id`.
    pub async fn ingest_chunks(
        &self,
        entity_id: &str,
        chunks: Vec<IngestChunkInput>,
    ) -> Result<IngestResult> {
        if chunks.is_empty() {
            return Ok(IngestResult { total: 0, indexed: 0, duplicate: 0 });
        }

        let doc_id = chunks[0].doc_id.clone();
        if let Some(mismatched) = chunks.iter().find(|c| c.doc_id != doc_id) {
            return Err(Error::MismatchedDocId {
                expected: doc_id,
                got: mismatched.doc_id.clone(),
            });
        }

        let entity = self.get_entity(entity_id, false).await?;
        let entity_dir = self.entity_dir_path(&entity.dir);
        let store = self.rag_manager.get_entity_store(entity_id, Some(entity_dir)).await?;

        let existing = store.get_document_chunks_in_order(&doc_id).await?;
        let existing_ids: std::collections::HashSet<String> =
            existing.iter().map(|c| c.chunk_id.clone()).collect();

        let total = chunks.len();
        let mut duplicate = 0;
        let mut fresh = Vec::new();
        for chunk in chunks {
            let chunk_id = crate::model::Chunk::id_for(&doc_id, chunk.chunk_order_index);
            if existing_ids.contains(&chunk_id) {
                duplicate += 1;
            } else {
                fresh.push(chunk);
            }
        }

        if fresh.is_empty() {
            return Ok(IngestResult { total, indexed: 0, duplicate });
        }

        let doc_name = fresh[0].doc_name.clone();
        let doc_path = fresh[0].doc_path.clone();
        let content_hash = fresh[0].content_hash.clone();
        let file_size = fresh[0].file_size;
        let indexed = fresh.len();

        let chunk_inputs: Vec<rag_store::ChunkInput> = fresh
            .into_iter()
            .map(|c| rag_store::ChunkInput {
                chunk_order_index: c.chunk_order_index,
                content: c.content,
                source: c.source,
                pages: Vec::new(),
                tokens: None,
                metadata: c.metadata,
                embedding: c.embedding,
            })
            .collect();

        store
            .add_chunks_batch(&doc_id, &doc_name, &doc_path, &content_hash, file_size, chunk_inputs, None, 0.0)
            .await?;

        Ok(IngestResult { total, indexed, duplicate })
    }

    // ---- chat sessions -------------------------------------------------

    pub async fn create_chat_session(
        &self,
        entity_id: &str,
        name: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Session> {
        let entity = self.get_entity(entity_id, false).await?;
        let now = Utc::now();
        let session = Session {
            session_id: format!("session_{}", short_uuid()),
            entity_id: entity_id.to_string(),
            entity_name: name.unwrap_or_else(|| entity.name.clone()),
            entity_dir: entity.dir.clone(),
            created_at: now,
            last_accessed: now,
            message_count: 0,
            estimated_cost_usd: 0.0,
            metadata,
            conversation_history: Vec::new(),
        };

        self.store
            .update_one("sessions", &json!({"_id": session.session_id}), &session_update(&session), true)
            .await?;
        self.store
            .update_one(
                &format!("sessions_{entity_id}"),
                &json!({"_id": session.session_id}),
                &session_update(&session),
                true,
            )
            .await?;
        self.store
            .update_one("entities", &json!({"_id": entity_id}), &Update::new().inc("sessions_count", 1.0), false)
            .await?;

        Ok(session)
    }

    /// Run one chat turn. `stream = true` yields each event on a channel as
    /// the agent produces it; `stream = false` runs the turn to completion
    /// first and hands back only the terminal event. Either way, the
    /// per-session lock (E) is held for the full
    /// append-user/stream/append-assistant/persist sequence.
    pub async fn chat_session_converse(
        self: &Arc<Self>,
        session_id: &str,
        user_message: String,
        stream: bool,
    ) -> Result<ConverseOutput> {
        if !stream {
            let terminal = self.run_turn_locked(session_id, user_message, |_| {}).await?;
            return Ok(ConverseOutput::Complete(terminal));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        let manager = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let tx_events = tx.clone();
            let result = manager
                .run_turn_locked(&session_id, user_message, move |event| {
                    let _ = tx_events.try_send(Ok(event));
                })
                .await;
            if let Err(err) = result {
                let _ = tx.try_send(Err(err));
            }
        });
        Ok(ConverseOutput::Stream(rx))
    }

    async fn run_turn_locked(
        self: &Arc<Self>,
        session_id: &str,
        user_message: String,
        mut on_event: impl FnMut(ResponseEvent) + Send + 'static,
    ) -> Result<ResponseEvent> {
        let _turn_guard = self.session_locks.acquire(session_id).await;

        let doc = self
            .store
            .find_one("sessions", &json!({"_id": session_id}))
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut session: Session = serde_json::from_value(doc)?;
        let entity = self.get_entity(&session.entity_id, false).await?;

        let agent = match self.session_locks.get_cached(session_id) {
            Some(agent) => agent,
            None => {
                let entity_dir = self.entity_dir_path(&entity.dir);
                let entity_store = self.rag_manager.get_entity_store(&entity.id, Some(entity_dir)).await?;
                let agent = Arc::new(ResearchAgent::new(
                    entity.id.clone(),
                    entity.name.clone(),
                    entity_store,
                    self.embedder.clone(),
                    self.provider.clone(),
                    self.model.clone(),
                    self.temperature,
                ));
                self.session_locks.cache_agent(session_id, agent.clone());
                agent
            }
        };

        let now = Utc::now();
        let id = short_uuid();
        let task_id = format!("chat_{}", &id[..13.min(id.len())]);
        let task = Task {
            task_id: task_id.clone(),
            task_type: TaskType::Chat,
            status: TaskStatus::Processing,
            created_at: now,
            processing_started_at: Some(now),
            completed_at: None,
            entity_id: entity.id.clone(),
            estimated_cost_usd: 0.0,
            doc_id: None,
            chunks_count: None,
            is_duplicate: None,
            session_id: Some(session_id.to_string()),
            error_message: None,
        };
        self.store
            .update_one("tasks", &json!({"_id": task_id}), &task_update(&task), true)
            .await?;

        session.conversation_history.push(ConversationEntry {
            role: ConversationRole::User,
            content: user_message,
            timestamp: now,
            task_id: Some(task_id.clone()),
            node_ids: Vec::new(),
            relationship_ids: Vec::new(),
            cited_node_ids: Vec::new(),
            services_used: Vec::new(),
            estimated_cost_usd: None,
        });

        let transcript: Vec<Message> = session
            .conversation_history
            .iter()
            .map(|entry| match entry.role {
                ConversationRole::User => Message::user(entry.content.clone()),
                ConversationRole::Assistant => Message::assistant(entry.content.clone()),
                ConversationRole::System => Message::system(entry.content.clone()),
            })
            .collect();

        let terminal = match agent.run_turn(transcript, &mut on_event).await {
            Ok(terminal) => terminal,
            Err(err) => {
                let _ = self
                    .store
                    .update_one(
                        "tasks",
                        &json!({"_id": task_id}),
                        &Update::new()
                            .set("status", "failed")
                            .set("completed_at", Utc::now().to_rfc3339())
                            .set("error_message", err.to_string()),
                        false,
                    )
                    .await;
                return Err(err);
            }
        };

        let completed_at = Utc::now();
        session.conversation_history.push(ConversationEntry {
            role: ConversationRole::Assistant,
            content: terminal.content.clone(),
            timestamp: completed_at,
            task_id: Some(task_id.clone()),
            node_ids: terminal.node_ids.clone(),
            relationship_ids: terminal.relationship_ids.clone(),
            cited_node_ids: terminal.cited_node_ids.clone(),
            services_used: terminal.services_used.clone(),
            estimated_cost_usd: Some(terminal.estimated_cost_usd),
        });
        session.message_count += 2;
        session.estimated_cost_usd += terminal.estimated_cost_usd;
        session.last_accessed = completed_at;

        self.store
            .update_one(
                "sessions",
                &json!({"_id": session_id}),
                &Update::new()
                    .set("conversation_history", serde_json::to_value(&session.conversation_history)?)
                    .set("message_count", session.message_count as i64)
                    .set("estimated_cost_usd", session.estimated_cost_usd)
                    .set("last_accessed", completed_at.to_rfc3339()),
                false,
            )
            .await?;
        self.store
            .update_one(
                "tasks",
                &json!({"_id": task_id}),
                &Update::new()
                    .set("status", "completed")
                    .set("completed_at", completed_at.to_rfc3339())
                    .set("estimated_cost_usd", terminal.estimated_cost_usd),
                false,
            )
            .await?;
        self.store
            .update_one(
                "entities",
                &json!({"_id": entity.id}),
                &Update::new().inc("estimated_cost_usd", terminal.estimated_cost_usd),
                false,
            )
            .await?;

        Ok(terminal)
    }

    /// Evict the cached agent/lock, move the session record to
    /// `[DELETED]…`, and decrement the owning entity's session count.
    pub async fn delete_chat_session(&self, session_id: &str) -> Result<()> {
        let doc = self
            .store
            .find_one("sessions", &json!({"_id": session_id}))
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut session: Session = serde_json::from_value(doc)?;

        self.session_locks.evict(session_id);

        let deleted_at = Utc::now();
        let deleted_id = format!("[DELETED]{session_id}_{}", deleted_at.to_rfc3339());
        self.store.delete_one("sessions", &json!({"_id": session_id})).await?;
        session.session_id = deleted_id;
        self.store
            .update_one("sessions", &json!({"_id": session.session_id}), &session_update(&session), true)
            .await?;

        self.store
            .update_one(
                "entities",
                &json!({"_id": session.entity_id}),
                &Update::new().inc("sessions_count", -1.0),
                false,
            )
            .await?;
        Ok(())
    }

    /// Nodes per unique `(entity, doc, chunk_order_index)` plus `sequential`
    /// edges between adjacent chunks in the same document.
    pub async fn get_knowledge_graph(&self, entity_ids: &[String]) -> Result<(Vec<Node>, Vec<Relationship>)> {
        let mut nodes = Vec::new();
        let mut relationships = Vec::new();

        for entity_id in entity_ids {
            let entity = self.get_entity(entity_id, false).await?;
            let entity_dir = self.entity_dir_path(&entity.dir);
            let store = self.rag_manager.get_entity_store(entity_id, Some(entity_dir)).await?;
            let docs = store.get_entity_documents().await?;

            for doc in &docs {
                let Some(doc_id) = doc.get("doc_id").and_then(Value::as_str) else { continue };
                let chunks = store.get_document_chunks_in_order(doc_id).await?;

                let mut previous_node_id: Option<String> = None;
                for chunk in &chunks {
                    let node_id = Node::id_for(entity_id, doc_id, chunk.chunk_order_index);
                    nodes.push(Node {
                        id: node_id.clone(),
                        entity_id: entity_id.clone(),
                        doc_id: doc_id.to_string(),
                        chunk_order_index: chunk.chunk_order_index,
                    });
                    if let Some(prev) = previous_node_id {
                        relationships.push(Relationship {
                            id: Relationship::id_for(&prev, &node_id),
                            source_node_id: prev,
                            target_node_id: node_id.clone(),
                            label: RelationshipLabel::Sequential,
                        });
                    }
                    previous_node_id = Some(node_id);
                }
            }
        }

        Ok((nodes, relationships))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upload_job(
    store: Arc<Store>,
    rag_manager: Arc<EntityRagManager>,
    entity_id: String,
    entity_dir: PathBuf,
    task_id: String,
    file_bytes: Vec<u8>,
    doc_name: String,
    doc_path: String,
    source: Option<String>,
) {
    let _ = store
        .update_one(
            "tasks",
            &json!({"_id": task_id}),
            &Update::new().set("status", "processing").set("processing_started_at", Utc::now().to_rfc3339()),
            false,
        )
        .await;

    let entity_doc = match store.find_one("entities", &json!({"_id": entity_id})).await {
        Ok(Some(doc)) => doc,
        _ => {
            fail_task(&store, &task_id, "entity no longer exists").await;
            return;
        }
    };
    let entity: Entity = match serde_json::from_value(entity_doc) {
        Ok(e) => e,
        Err(_) => {
            fail_task(&store, &task_id, "entity record corrupt").await;
            return;
        }
    };
    if entity.deleted_at.is_some() || !entity_dir.is_dir() {
        fail_task(&store, &task_id, "entity was deleted or its directory is missing").await;
        return;
    }

    let outcome = rag_manager
        .add_document(&entity_id, Some(entity_dir), &file_bytes, &doc_name, &doc_path, source.as_deref(), None)
        .await;

    match outcome {
        Ok((outcome, _services)) if outcome.is_duplicate => {
            let _ = store
                .update_one(
                    "tasks",
                    &json!({"_id": task_id}),
                    &Update::new()
                        .set("status", "completed")
                        .set("completed_at", Utc::now().to_rfc3339())
                        .set("estimated_cost_usd", 0.0)
                        .set("doc_id", outcome.doc_id)
                        .set("chunks_count", 0)
                        .set("is_duplicate", true),
                    false,
                )
                .await;
        }
        Ok((outcome, _services)) => {
            let completed_at = Utc::now();
            let _ = store
                .update_one(
                    "tasks",
                    &json!({"_id": task_id}),
                    &Update::new()
                        .set("status", "completed")
                        .set("completed_at", completed_at.to_rfc3339())
                        .set("estimated_cost_usd", outcome.estimated_cost_usd)
                        .set("doc_id", outcome.doc_id)
                        .set("chunks_count", outcome.chunks_count as i64)
                        .set("is_duplicate", false),
                    false,
                )
                .await;
            // Deliberately a second, separate write: the entity's running
            // counters are never folded into the task's own completion write.
            let _ = store
                .update_one(
                    "entities",
                    &json!({"_id": entity_id}),
                    &Update::new()
                        .inc("estimated_cost_usd", outcome.estimated_cost_usd)
                        .inc("documents_count", 1.0)
                        .inc("chunk_count", outcome.chunks_count as f64),
                    false,
                )
                .await;
        }
        Err(err) => {
            fail_task(&store, &task_id, err.to_string()).await;
        }
    }
}

async fn fail_task(store: &Store, task_id: &str, message: impl Into<String>) {
    let _ = store
        .update_one(
            "tasks",
            &json!({"_id": task_id}),
            &Update::new()
                .set("status", "failed")
                .set("completed_at", Utc::now().to_rfc3339())
                .set("error_message", message.into()),
            false,
        )
        .await;
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn entity_update(entity: &Entity) -> Update {
    Update::new()
        .set_on_insert("_id", entity.id.clone())
        .set("name", entity.name.clone())
        .set("dir", entity.dir.clone())
        .set("created_at", entity.created_at.to_rfc3339())
        .set("documents_count", entity.documents_count as i64)
        .set("chunk_count", entity.chunk_count as i64)
        .set("sessions_count", entity.sessions_count as i64)
        .set("estimated_cost_usd", entity.estimated_cost_usd)
        .set("last_accessed", entity.last_accessed.to_rfc3339())
        .set("metadata", entity.metadata.clone().unwrap_or(Value::Null))
        .set("description", entity.description.clone().map(Value::String).unwrap_or(Value::Null))
        .set(
            "deleted_at",
            entity.deleted_at.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null),
        )
}

fn session_update(session: &Session) -> Update {
    Update::new()
        .set_on_insert("_id", session.session_id.clone())
        .set("entity_id", session.entity_id.clone())
        .set("entity_name", session.entity_name.clone())
        .set("entity_dir", session.entity_dir.clone())
        .set("created_at", session.created_at.to_rfc3339())
        .set("last_accessed", session.last_accessed.to_rfc3339())
        .set("message_count", session.message_count as i64)
        .set("estimated_cost_usd", session.estimated_cost_usd)
        .set("metadata", session.metadata.clone().unwrap_or(Value::Null))
        .set(
            "conversation_history",
            serde_json::to_value(&session.conversation_history).unwrap_or(Value::Array(Vec::new())),
        )
}

fn task_update(task: &Task) -> Update {
    Update::new()
        .set_on_insert("_id", task.task_id.clone())
        .set("task_type", if task.task_type == TaskType::Upload { "upload" } else { "chat" })
        .set("status", status_str(task.status))
        .set("created_at", task.created_at.to_rfc3339())
        .set(
            "processing_started_at",
            task.processing_started_at.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null),
        )
        .set("completed_at", task.completed_at.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null))
        .set("entity_id", task.entity_id.clone())
        .set("estimated_cost_usd", task.estimated_cost_usd)
        .set("doc_id", task.doc_id.clone().map(Value::String).unwrap_or(Value::Null))
        .set("chunks_count", task.chunks_count.map(|c| json!(c)).unwrap_or(Value::Null))
        .set("is_duplicate", task.is_duplicate.map(Value::Bool).unwrap_or(Value::Null))
        .set("session_id", task.session_id.clone().map(Value::String).unwrap_or(Value::Null))
        .set("error_message", task.error_message.clone().map(Value::String).unwrap_or(Value::Null))
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Processing => "processing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}
