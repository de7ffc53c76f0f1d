use async_trait::async_trait;
use couch::{Couch, CouchError};
use serde_json::Value;

use crate::store::{DocBackend, StoreError};

/// Production backend: one named database on a CouchDB server.
pub struct CouchBackend {
    couch: Couch,
    db_name: String,
}

impl CouchBackend {
    pub fn new(couch: Couch, db_name: impl Into<String>) -> Self {
        Self {
            couch,
            db_name: db_name.into(),
        }
    }
}

#[async_trait]
impl DocBackend for CouchBackend {
    async fn get(&self, doc_id: &str) -> Result<Option<Value>, StoreError> {
        self.couch
            .get(&self.db_name, doc_id)
            .await
            .map_err(StoreError::Couch)
    }

    async fn put(&self, doc_id: &str, doc: Value) -> Result<(), StoreError> {
        match self.couch.put(&self.db_name, doc_id, &doc).await {
            Ok(()) => Ok(()),
            Err(CouchError::Conflict) => Err(StoreError::Conflict(doc_id.to_string())),
            Err(err) => Err(StoreError::Couch(err)),
        }
    }
}
