use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::store::{DocBackend, StoreError};

/// In-memory backend with real revision-conflict semantics, for dev runs and
/// tests. Revisions are `<generation>-<counter>` strings, which is close
/// enough to CouchDB's `<generation>-<digest>` for everything above the
/// backend trait.
#[derive(Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct write bypassing revision checks. This is how tests model an
    /// external actor that talks to the database without going through the
    /// document entity.
    pub fn put_raw(&self, doc_id: &str, doc: Value) {
        self.docs.lock().unwrap().insert(doc_id.to_string(), doc);
    }
}

#[async_trait]
impl DocBackend for MemoryBackend {
    async fn get(&self, doc_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.lock().unwrap().get(doc_id).cloned())
    }

    async fn put(&self, doc_id: &str, mut doc: Value) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().unwrap();

        let stored_rev = docs
            .get(doc_id)
            .and_then(|stored| stored.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let incoming_rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);

        if stored_rev != incoming_rev {
            return Err(StoreError::Conflict(doc_id.to_string()));
        }

        let generation = stored_rev
            .as_deref()
            .and_then(|rev| rev.split('-').next())
            .and_then(|g| g.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        doc["_rev"] = json!(format!("{generation}-{:08x}", generation.wrapping_mul(0x9e3779b9)));

        docs.insert(doc_id.to_string(), doc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let backend = MemoryBackend::new();
        backend
            .put("P1", json!({"_id": "P1", "value": 1}))
            .await
            .unwrap();
        let doc = backend.get("P1").await.unwrap().unwrap();
        assert_eq!(doc["value"], json!(1));
        assert!(doc["_rev"].as_str().unwrap().starts_with("1-"));
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let backend = MemoryBackend::new();
        backend.put("P1", json!({"_id": "P1"})).await.unwrap();

        // A write without the stored revision must fail.
        let result = backend.put("P1", json!({"_id": "P1"})).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // A write carrying the stored revision succeeds and bumps it.
        let stored = backend.get("P1").await.unwrap().unwrap();
        let mut update = stored.clone();
        update["value"] = json!(2);
        backend.put("P1", update).await.unwrap();
        let updated = backend.get("P1").await.unwrap().unwrap();
        assert!(updated["_rev"].as_str().unwrap().starts_with("2-"));
    }
}
