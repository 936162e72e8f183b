//! Crash-safe sharded JSON document store (component A, `ShardedKVStore`).
//!
//! Each collection is either a single file `<root>/<coll>.json` or, when a
//! document resolves a shard key (`entity_id`, or a single-element
//! `entity_ids`), a directory of per-shard files
//! `<root>/<coll>/<shard>.json`. Every load-modify-save sequence for a given
//! file holds that file's mutex end-to-end, eliminating TOCTOU races; the
//! write itself lands via a temp-file-then-rename so a killed process never
//! leaves a collection file partially written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::query;
use crate::update::Update;

/// Outcome of `update_one`/`update_many`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateResult {
    pub matched: usize,
    pub modified: usize,
    pub upserted: bool,
}

/// A minimal aggregation pipeline stage.
pub enum Stage {
    Match(Value),
    GroupSum { id_field: String, sum_field: String, out: String },
    GroupPush { id_field: String, push_field: String, out: String },
}

/// Process-wide (or per-handle) JSON document store.
///
/// Modeled as an explicit handle threaded through constructors rather than
/// held as a process-global static, so a process can own more than one
/// store (or swap one out in tests) without touching global state.
pub struct Store {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn flat_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    fn shard_path(&self, collection: &str, shard: &str) -> PathBuf {
        self.root.join(collection).join(format!("{shard}.json"))
    }

    fn shard_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn read_json(path: &Path) -> Map<String, Value> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    if !bytes.is_empty() {
                        tracing::error!(path = %path.display(), "corrupt collection file, treating as empty");
                    }
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        }
    }

    /// Atomic write: temp file in the same directory, fsync, rename over target.
    fn write_json(path: &Path, data: &Map<String, Value>) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            use std::io::Write;
            let bytes = serde_json::to_vec(data)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
        }
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn load_all_shards(&self, collection: &str) -> Map<String, Value> {
        let dir = self.shard_dir(collection);
        let mut merged = Map::new();
        if dir.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        merged.extend(Self::read_json(&path));
                    }
                }
            }
        }
        let flat = self.flat_path(collection);
        if flat.is_file() {
            merged.extend(Self::read_json(&flat));
        }
        merged
    }

    fn extract_shard_key(query: &Value) -> Option<String> {
        extract_shard_key_from_map(query)
    }

    fn extract_shard_key_from_update(update: &Update) -> Option<String> {
        update.probe_shard_key()
    }

    // ---- reads ---------------------------------------------------------

    pub async fn find_one(&self, collection: &str, query_doc: &Value) -> Result<Option<Value>> {
        let shard = Self::extract_shard_key(query_doc);
        let map = match &shard {
            Some(key) => {
                let path = self.shard_path(collection, key);
                let _guard = self.lock_for(&path).lock_owned().await;
                Self::read_json(&path)
            }
            None => self.load_all_shards(collection),
        };
        for doc in map.values() {
            if query::matches(doc, query_doc) {
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }

    pub async fn find(&self, collection: &str, query_doc: Option<&Value>) -> Result<Vec<Value>> {
        let shard = query_doc.and_then(Self::extract_shard_key);
        let map = match &shard {
            Some(key) => {
                let path = self.shard_path(collection, key);
                let _guard = self.lock_for(&path).lock_owned().await;
                Self::read_json(&path)
            }
            None => self.load_all_shards(collection),
        };
        let mut out = Vec::new();
        for doc in map.values() {
            if query_doc.map(|q| query::matches(doc, q)).unwrap_or(true) {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }

    // ---- writes ---------------------------------------------------------

    pub async fn update_one(
        &self,
        collection: &str,
        query_doc: &Value,
        update: &Update,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let mut shard = Self::extract_shard_key(query_doc);
        if shard.is_none() && upsert {
            shard = Self::extract_shard_key_from_update(update);
        }
        let path = match &shard {
            Some(key) => self.shard_path(collection, key),
            None => self.flat_path(collection),
        };
        let lock = self.lock_for(&path);
        let _guard = lock.lock_owned().await;

        let mut map = Self::read_json(&path);
        let matched_id = map
            .iter()
            .find(|(_, doc)| query::matches(doc, query_doc))
            .map(|(id, _)| id.clone());

        let result = if let Some(id) = matched_id {
            let doc = map.get_mut(&id).expect("matched id present");
            update.apply(doc, false);
            Self::write_json(&path, &map)?;
            UpdateResult { matched: 1, modified: 1, upserted: false }
        } else if upsert {
            let new_id = query_doc
                .get("_id")
                .or_else(|| query_doc.get("doc_id"))
                .or_else(|| query_doc.get("entity_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| map.len().to_string());

            let mut new_doc = Value::Object(Map::new());
            update.apply(&mut new_doc, true);
            if let Some(obj) = new_doc.as_object_mut() {
                obj.entry("_id").or_insert_with(|| Value::String(new_id.clone()));
            }
            map.insert(new_id, new_doc);
            Self::write_json(&path, &map)?;
            UpdateResult { matched: 0, modified: 1, upserted: true }
        } else {
            UpdateResult::default()
        };
        Ok(result)
    }

    pub async fn update_many(
        &self,
        collection: &str,
        query_doc: &Value,
        update: &Update,
    ) -> Result<UpdateResult> {
        let shard = Self::extract_shard_key(query_doc);

        if let Some(key) = shard {
            let path = self.shard_path(collection, &key);
            let lock = self.lock_for(&path);
            let _guard = lock.lock_owned().await;
            let mut map = Self::read_json(&path);
            let mut matched = 0;
            let mut modified = 0;
            for doc in map.values_mut() {
                if query::matches(doc, query_doc) {
                    matched += 1;
                    update.apply(doc, false);
                    modified += 1;
                }
            }
            if modified > 0 {
                Self::write_json(&path, &map)?;
            }
            return Ok(UpdateResult { matched, modified, upserted: false });
        }

        // No shard key: operate over the merged view, then regroup and save
        // only the shards that actually contain a matched document.
        let merged = self.load_all_shards(collection);
        let mut matched = 0;
        let mut modified = 0;
        let mut touched: HashMap<Option<String>, Map<String, Value>> = HashMap::new();

        for (id, mut doc) in merged {
            if query::matches(&doc, query_doc) {
                matched += 1;
                update.apply(&mut doc, false);
                modified += 1;
            }
            let key = extract_shard_key_from_map(&doc);
            touched.entry(key).or_default().insert(id, doc);
        }

        for (key, shard_docs) in touched {
            self.save_regrouped(collection, key.as_deref(), shard_docs).await?;
        }

        Ok(UpdateResult { matched, modified, upserted: false })
    }

    pub async fn delete_one(&self, collection: &str, query_doc: &Value) -> Result<usize> {
        let shard = Self::extract_shard_key(query_doc);
        if let Some(key) = shard {
            let path = self.shard_path(collection, &key);
            let lock = self.lock_for(&path);
            let _guard = lock.lock_owned().await;
            let mut map = Self::read_json(&path);
            let hit = map.iter().find(|(_, d)| query::matches(d, query_doc)).map(|(id, _)| id.clone());
            if let Some(id) = hit {
                map.remove(&id);
                Self::write_json(&path, &map)?;
                return Ok(1);
            }
            return Ok(0);
        }

        // No shard key on the query: the matching document could be in any
        // shard file, so visit each under its own lock and read-match-write
        // within that single critical section, rather than building one
        // cross-shard snapshot that a concurrent writer could invalidate
        // before this method's own write lands.
        for path in self.all_shard_files(collection) {
            let lock = self.lock_for(&path);
            let _guard = lock.lock_owned().await;
            let mut map = Self::read_json(&path);
            let hit = map.iter().find(|(_, d)| query::matches(d, query_doc)).map(|(id, _)| id.clone());
            if let Some(id) = hit {
                map.remove(&id);
                Self::write_json(&path, &map)?;
                return Ok(1);
            }
        }
        Ok(0)
    }

    pub async fn delete_many(&self, collection: &str, query_doc: &Value) -> Result<usize> {
        let shard = Self::extract_shard_key(query_doc);
        if let Some(key) = shard {
            let path = self.shard_path(collection, &key);
            let lock = self.lock_for(&path);
            let _guard = lock.lock_owned().await;
            let mut map = Self::read_json(&path);
            let before = map.len();
            map.retain(|_, d| !query::matches(d, query_doc));
            let deleted = before - map.len();
            if deleted > 0 {
                Self::write_json(&path, &map)?;
            }
            return Ok(deleted);
        }

        // Same per-file locking rationale as delete_one above: each shard
        // file's own read-filter-write happens under that file's lock, so a
        // concurrent write to an untouched document in the same file is
        // never clobbered by this method overwriting a stale snapshot of it.
        let mut deleted = 0;
        for path in self.all_shard_files(collection) {
            let lock = self.lock_for(&path);
            let _guard = lock.lock_owned().await;
            let mut map = Self::read_json(&path);
            let before = map.len();
            map.retain(|_, d| !query::matches(d, query_doc));
            let removed = before - map.len();
            if removed > 0 {
                Self::write_json(&path, &map)?;
                deleted += removed;
            }
        }
        Ok(deleted)
    }

    async fn save_regrouped(
        &self,
        collection: &str,
        key: Option<&str>,
        docs: Map<String, Value>,
    ) -> Result<()> {
        let path = match key {
            Some(k) => self.shard_path(collection, k),
            None => self.flat_path(collection),
        };
        // This shard's own docs, merged with whatever else already lives there
        // that wasn't part of this operation's touched set.
        let lock = self.lock_for(&path);
        let _guard = lock.lock_owned().await;
        let mut existing = Self::read_json(&path);
        existing.extend(docs);
        Self::write_json(&path, &existing)
    }

    /// Every per-shard file plus the flat file, if either exists, for a
    /// collection that has no shard key to route a query/delete/update
    /// directly to a single file.
    fn all_shard_files(&self, collection: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let dir = self.shard_dir(collection);
        if dir.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        paths.push(path);
                    }
                }
            }
        }
        let flat = self.flat_path(collection);
        if flat.is_file() {
            paths.push(flat);
        }
        paths
    }

    pub async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Value>> {
        let map = self.load_all_shards(collection);
        let mut docs: Vec<Value> = map.into_values().collect();

        for stage in pipeline {
            match stage {
                Stage::Match(q) => docs.retain(|d| query::matches(d, q)),
                Stage::GroupSum { id_field, sum_field, out } => {
                    docs = group_sum(&docs, id_field, sum_field, out);
                }
                Stage::GroupPush { id_field, push_field, out } => {
                    docs = group_push(&docs, id_field, push_field, out);
                }
            }
        }
        Ok(docs)
    }
}

fn extract_shard_key_from_map(doc: &Value) -> Option<String> {
    if let Some(s) = doc.get("entity_id").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(arr) = doc.get("entity_ids").and_then(Value::as_array) {
        if arr.len() == 1 {
            if let Some(s) = arr[0].as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn group_sum(docs: &[Value], id_field: &str, sum_field: &str, out: &str) -> Vec<Value> {
    let mut groups: indexmap::IndexMap<String, f64> = indexmap::IndexMap::new();
    for doc in docs {
        let key = query::get_path(doc, id_field)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let val = query::get_path(doc, sum_field).and_then(Value::as_f64).unwrap_or(0.0);
        *groups.entry(key).or_insert(0.0) += val;
    }
    groups
        .into_iter()
        .map(|(id, sum)| serde_json::json!({"_id": id, out: sum}))
        .collect()
}

fn group_push(docs: &[Value], id_field: &str, push_field: &str, out: &str) -> Vec<Value> {
    let mut groups: indexmap::IndexMap<String, Vec<Value>> = indexmap::IndexMap::new();
    for doc in docs {
        let key = query::get_path(doc, id_field)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let val = query::get_path(doc, push_field).cloned().unwrap_or(Value::Null);
        groups.entry(key).or_default().push(val);
    }
    groups
        .into_iter()
        .map(|(id, items)| serde_json::json!({"_id": id, out: items}))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_then_update_flat_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store
            .update_one(
                "entities",
                &json!({"_id": "e1"}),
                &Update::new().set_on_insert("_id", "e1").set("name", "E1").inc("documents_count", 0.0),
                true,
            )
            .await
            .unwrap();
        assert!(res.upserted);

        let found = store.find_one("entities", &json!({"_id": "e1"})).await.unwrap().unwrap();
        assert_eq!(found["name"], "E1");

        store
            .update_one("entities", &json!({"_id": "e1"}), &Update::new().inc("documents_count", 2.0), false)
            .await
            .unwrap();
        let found = store.find_one("entities", &json!({"_id": "e1"})).await.unwrap().unwrap();
        assert_eq!(found["documents_count"], 2.0);
    }

    #[tokio::test]
    async fn sharded_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store
            .update_one(
                "chunks_e1",
                &json!({"_id": "chunk_D_0", "entity_id": "e1"}),
                &Update::new().set_on_insert("entity_id", "e1").set("content", "hello"),
                true,
            )
            .await
            .unwrap();

        assert!(dir.path().join("chunks_e1").join("e1.json").is_file());

        let docs = store.find("chunks_e1", Some(&json!({"entity_id": "e1"}))).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn delete_on_last_unlink_via_update_many() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store
            .update_one(
                "documents",
                &json!({"_id": "D1"}),
                &Update::new()
                    .set_on_insert("_id", "D1")
                    .add_to_set("entity_ids", "e1")
                    .add_to_set("entity_ids", "e2"),
                true,
            )
            .await
            .unwrap();

        let deleted = store.delete_one("documents", &json!({"_id": "D1"})).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find_one("documents", &json!({"_id": "D1"})).await.unwrap().is_none());
    }
}
