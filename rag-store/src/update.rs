//! MongoDB-subset update operators, modeled as a tagged-variant contract
//! rather than free-form dict dispatch (see spec design notes).

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// A single update operator targeting one field.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set(Value),
    Unset,
    Inc(f64),
    AddToSet(Value),
    SetOnInsert(Value),
}

/// A full update document: dot-path field -> ordered operators to apply.
///
/// Multiple operators against the same field are legal (e.g. `$set` on one
/// field and `$inc` on another in the same call); application order is fixed
/// regardless of insertion order: `$setOnInsert` (insert only), `$set`,
/// `$unset`, `$inc`, `$addToSet`.
#[derive(Debug, Clone, Default)]
pub struct Update {
    ops: IndexMap<String, Vec<UpdateOp>>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops
            .entry(field.into())
            .or_default()
            .push(UpdateOp::Set(value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.entry(field.into()).or_default().push(UpdateOp::Unset);
        self
    }

    pub fn inc(mut self, field: impl Into<String>, by: f64) -> Self {
        self.ops
            .entry(field.into())
            .or_default()
            .push(UpdateOp::Inc(by));
        self
    }

    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops
            .entry(field.into())
            .or_default()
            .push(UpdateOp::AddToSet(value.into()));
        self
    }

    pub fn set_on_insert(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops
            .entry(field.into())
            .or_default()
            .push(UpdateOp::SetOnInsert(value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Best-effort shard key lookup for upserts whose query has none: scan
    /// `$set`/`$setOnInsert`/`$addToSet` operators against `entity_id` and
    /// `entity_ids`, mirroring `_extract_shard_key_from_update`.
    pub fn probe_shard_key(&self) -> Option<String> {
        if let Some(ops) = self.ops.get("entity_id") {
            for op in ops {
                let value = match op {
                    UpdateOp::Set(v) | UpdateOp::SetOnInsert(v) => Some(v),
                    _ => None,
                };
                if let Some(s) = value.and_then(Value::as_str) {
                    return Some(s.to_string());
                }
            }
        }
        if let Some(ops) = self.ops.get("entity_ids") {
            for op in ops {
                let value = match op {
                    UpdateOp::Set(v) | UpdateOp::SetOnInsert(v) | UpdateOp::AddToSet(v) => Some(v),
                    _ => None,
                };
                match value {
                    Some(Value::Array(arr)) if arr.len() == 1 => {
                        if let Some(s) = arr[0].as_str() {
                            return Some(s.to_string());
                        }
                    }
                    Some(v) => {
                        if let Some(s) = v.as_str() {
                            return Some(s.to_string());
                        }
                    }
                    None => {}
                }
            }
        }
        None
    }

    /// Apply this update to `doc` in place. `is_insert` gates `$setOnInsert`.
    pub fn apply(&self, doc: &mut Value, is_insert: bool) {
        if !doc.is_object() {
            *doc = Value::Object(Map::new());
        }

        for phase in [Phase::SetOnInsert, Phase::Set, Phase::Unset, Phase::Inc, Phase::AddToSet] {
            for (field, ops) in &self.ops {
                for op in ops {
                    if phase.matches(op) {
                        apply_one(doc, field, op, is_insert);
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    SetOnInsert,
    Set,
    Unset,
    Inc,
    AddToSet,
}

impl Phase {
    fn matches(self, op: &UpdateOp) -> bool {
        matches!(
            (self, op),
            (Phase::SetOnInsert, UpdateOp::SetOnInsert(_))
                | (Phase::Set, UpdateOp::Set(_))
                | (Phase::Unset, UpdateOp::Unset)
                | (Phase::Inc, UpdateOp::Inc(_))
                | (Phase::AddToSet, UpdateOp::AddToSet(_))
        )
    }
}

fn apply_one(doc: &mut Value, field: &str, op: &UpdateOp, is_insert: bool) {
    match op {
        UpdateOp::SetOnInsert(value) => {
            if is_insert {
                set_path(doc, field, value.clone());
            }
        }
        UpdateOp::Set(value) => set_path(doc, field, value.clone()),
        UpdateOp::Unset => unset_path(doc, field),
        UpdateOp::Inc(by) => {
            let current = get_path(doc, field).and_then(Value::as_f64).unwrap_or(0.0);
            set_path(doc, field, serde_json::json!(current + by));
        }
        UpdateOp::AddToSet(value) => {
            let entry = get_path_mut(doc, field);
            match entry {
                Value::Array(arr) => {
                    if !arr.iter().any(|v| v == value) {
                        arr.push(value.clone());
                    }
                }
                other => {
                    *other = Value::Array(vec![value.clone()]);
                }
            }
        }
    }
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Navigate to `path`, creating intermediate objects as needed, and return a
/// mutable reference to the (possibly freshly-created `Null`) leaf.
fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> &'a mut Value {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for segment in &segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("just ensured object");
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    current
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    *get_path_mut(doc, path) = value;
}

fn unset_path(doc: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() == 1 {
        if let Some(map) = doc.as_object_mut() {
            map.remove(segments[0]);
        }
        return;
    }
    let parent_path = segments[..segments.len() - 1].join(".");
    if let Some(parent) = get_path(doc, &parent_path).cloned() {
        let mut parent = parent;
        if let Some(map) = parent.as_object_mut() {
            map.remove(segments[segments.len() - 1]);
        }
        set_path(doc, &parent_path, parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_unset() {
        let mut doc = json!({"a": 1});
        Update::new().set("b", 2).apply(&mut doc, false);
        assert_eq!(doc["b"], 2);
        Update::new().unset("a").apply(&mut doc, false);
        assert!(doc.get("a").is_none());
    }

    #[test]
    fn inc_creates_field() {
        let mut doc = json!({});
        Update::new().inc("count", 3.0).apply(&mut doc, false);
        assert_eq!(doc["count"], 3.0);
        Update::new().inc("count", 2.0).apply(&mut doc, false);
        assert_eq!(doc["count"], 5.0);
    }

    #[test]
    fn add_to_set_dedupes() {
        let mut doc = json!({});
        Update::new()
            .add_to_set("tags", "x")
            .apply(&mut doc, false);
        Update::new()
            .add_to_set("tags", "x")
            .apply(&mut doc, false);
        Update::new()
            .add_to_set("tags", "y")
            .apply(&mut doc, false);
        assert_eq!(doc["tags"], json!(["x", "y"]));
    }

    #[test]
    fn set_on_insert_only_applies_on_insert() {
        let mut doc = json!({});
        Update::new()
            .set_on_insert("doc_id", "abc")
            .apply(&mut doc, false);
        assert!(doc.get("doc_id").is_none());

        Update::new()
            .set_on_insert("doc_id", "abc")
            .apply(&mut doc, true);
        assert_eq!(doc["doc_id"], "abc");
    }

    #[test]
    fn dot_path_nested() {
        let mut doc = json!({});
        Update::new().set("metadata.source", "upload").apply(&mut doc, false);
        assert_eq!(doc["metadata"]["source"], "upload");
    }
}
