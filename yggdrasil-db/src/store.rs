use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document update conflict for '{0}'")]
    Conflict(String),

    #[error("error talking to CouchDB")]
    Couch(#[source] couch::CouchError),

    #[error("stored document is not valid")]
    Deserialize(#[from] serde_json::Error),
}

/// Raw keyed JSON storage with CouchDB revision semantics: a `put` must carry
/// the stored `_rev` (or none for a fresh document) or it fails with
/// `Conflict`. Everything above this trait works on typed documents.
#[async_trait]
pub trait DocBackend: Send + Sync {
    async fn get(&self, doc_id: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, doc_id: &str, doc: Value) -> Result<(), StoreError>;
}
