use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info};
use serde_json::Value;
use thiserror::Error;

use crate::document::{
    DeliveryEntry, DocumentError, ProjectStatus, QcStatus, SampleStatus, UserContact,
    YggdrasilDocument,
};
use crate::store::{DocBackend, StoreError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("project '{0}' not found in the yggdrasil database")]
    MissingProject(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Read/write access to the yggdrasil database. Every save re-reads the
/// stored revision and attaches it, so writers never have to track `_rev`
/// themselves; a genuine race still surfaces as `StoreError::Conflict` and is
/// resolved by dropping the write (the next event re-reads).
pub struct YggdrasilDbManager {
    backend: Arc<dyn DocBackend>,
}

impl YggdrasilDbManager {
    pub fn new(backend: Arc<dyn DocBackend>) -> Self {
        Self { backend }
    }

    pub async fn get_document(&self, project_id: &str) -> Option<YggdrasilDocument> {
        match self.backend.get(project_id).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(doc) => Some(doc),
                Err(err) => {
                    error!("Stored document for '{project_id}' is not readable: {err}");
                    None
                }
            },
            Ok(None) => {
                info!("Project with ID '{project_id}' not found.");
                None
            }
            Err(err) => {
                error!("Error accessing project '{project_id}': {err}");
                None
            }
        }
    }

    pub async fn project_exists(&self, project_id: &str) -> bool {
        match self.backend.get(project_id).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                error!("Error checking for project '{project_id}': {err}");
                false
            }
        }
    }

    /// Create the project document on first observation. Creating an already
    /// existing project is a no-op that hands back the stored document.
    pub async fn create_project(
        &self,
        project_id: &str,
        projects_reference: &str,
        project_name: &str,
        method: &str,
        user_info: Option<BTreeMap<String, UserContact>>,
        sensitive: bool,
    ) -> Option<YggdrasilDocument> {
        if self.project_exists(project_id).await {
            info!("Project with ID '{project_id}' already exists.");
            return self.get_document(project_id).await;
        }

        let mut document =
            YggdrasilDocument::new(project_id, projects_reference, project_name, method);
        if let Some(user_info) = user_info {
            document.user_info = user_info;
        }
        // Sensitive unless told otherwise.
        document.delivery_info.sensitive = sensitive;

        if let Err(err) = self.save_document(&mut document).await {
            error!("Error creating project '{project_id}': {err}");
            return None;
        }
        info!("New project with ID '{project_id}' created successfully.");
        Some(document)
    }

    pub async fn save_document(
        &self,
        document: &mut YggdrasilDocument,
    ) -> Result<(), StoreError> {
        // Attach the currently stored revision to avoid spurious conflicts.
        let stored = self.backend.get(&document.id).await?;
        document.rev = stored
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let value = serde_json::to_value(&*document)?;
        self.backend.put(&document.id, value).await?;
        info!("Document with ID '{}' saved in the yggdrasil database.", document.id);
        Ok(())
    }

    /// Load–mutate–save helper: fetches the document, hands it to the
    /// closure, and persists the result. Missing projects and save conflicts
    /// are logged here so call sites can stay terse.
    pub async fn with_document<F>(&self, project_id: &str, mutate: F) -> Result<(), DbError>
    where
        F: FnOnce(&mut YggdrasilDocument) -> Result<(), DocumentError>,
    {
        let Some(mut document) = self.get_document(project_id).await else {
            error!("Project '{project_id}' not found in the yggdrasil database.");
            return Err(DbError::MissingProject(project_id.to_string()));
        };

        mutate(&mut document).inspect_err(|err| {
            error!("[{project_id}] Document update rejected: {err}");
        })?;

        self.save_document(&mut document).await.inspect_err(|err| {
            error!("[{project_id}] Error saving document: {err}");
        })?;
        Ok(())
    }

    pub async fn add_sample(
        &self,
        project_id: &str,
        sample_id: &str,
        status: SampleStatus,
        flowcell_ids: &[String],
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| {
            doc.add_sample(sample_id, status, flowcell_ids);
            Ok(())
        })
        .await
    }

    pub async fn update_sample_status(
        &self,
        project_id: &str,
        sample_id: &str,
        status: SampleStatus,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| doc.update_sample_status(sample_id, status))
            .await
            .inspect(|_| info!("[{project_id}] Sample '{sample_id}' status set to '{status}'."))
    }

    pub async fn update_sample_field(
        &self,
        project_id: &str,
        sample_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| doc.update_sample_field(sample_id, field, value))
            .await
    }

    pub async fn add_flowcell_processed(
        &self,
        project_id: &str,
        sample_id: &str,
        flowcell_id: &str,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| {
            doc.add_flowcell_processed(sample_id, flowcell_id)
        })
        .await
    }

    pub async fn update_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| {
            doc.update_project_status(status);
            Ok(())
        })
        .await
        .inspect(|_| info!("[{project_id}] Project status set to '{status}'."))
    }

    pub async fn sync_project_metadata(
        &self,
        project_id: &str,
        user_info: &BTreeMap<String, UserContact>,
        sensitive: bool,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| {
            doc.sync_project_metadata(user_info, sensitive);
            Ok(())
        })
        .await
    }

    pub async fn add_ngi_report_entry(
        &self,
        project_id: &str,
        report_data: &Value,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| doc.add_ngi_report_entry(report_data))
            .await
            .inspect(|_| info!("[{project_id}] NGI report entry added."))
    }

    pub async fn add_delivery_entry(
        &self,
        project_id: &str,
        entry: DeliveryEntry,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| {
            doc.add_delivery_entry(entry);
            Ok(())
        })
        .await
    }

    pub async fn set_sample_qc(
        &self,
        project_id: &str,
        sample_id: &str,
        qc: QcStatus,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| doc.set_sample_qc(sample_id, qc))
            .await
    }

    pub async fn mark_sample_delivered(
        &self,
        project_id: &str,
        sample_id: &str,
    ) -> Result<(), DbError> {
        self.with_document(project_id, |doc| doc.mark_sample_delivered(sample_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryBackend;
    use serde_json::json;

    fn manager() -> YggdrasilDbManager {
        YggdrasilDbManager::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let ydm = manager();
        let first = ydm
            .create_project("P1", "doc-1", "Proj", "SmartSeq 3", None, true)
            .await
            .unwrap();
        assert_eq!(first.project_status, ProjectStatus::Pending);

        ydm.add_sample("P1", "P1_1", SampleStatus::Initialized, &[])
            .await
            .unwrap();

        // Second create must not regress the stored state.
        let second = ydm
            .create_project("P1", "doc-1", "Proj", "SmartSeq 3", None, true)
            .await
            .unwrap();
        assert_eq!(second.samples.len(), 1);
        assert!(ydm.project_exists("P1").await);
    }

    #[tokio::test]
    async fn save_attaches_the_stored_revision() {
        let ydm = manager();
        let mut doc = ydm
            .create_project("P2", "doc-2", "Proj", "10X Chromium", None, false)
            .await
            .unwrap();

        // Two consecutive saves from the same in-memory copy both succeed
        // because each one re-reads the revision.
        doc.add_sample("P2_1", SampleStatus::Pending, &[]);
        ydm.save_document(&mut doc).await.unwrap();
        doc.add_sample("P2_2", SampleStatus::Pending, &[]);
        ydm.save_document(&mut doc).await.unwrap();

        let stored = ydm.get_document("P2").await.unwrap();
        assert_eq!(stored.samples.len(), 2);
    }

    #[tokio::test]
    async fn convenience_wrappers_on_missing_project_are_noops() {
        let ydm = manager();
        let result = ydm
            .update_sample_status("ghost", "s1", SampleStatus::Completed)
            .await;
        assert!(matches!(result, Err(DbError::MissingProject(_))));
    }

    #[tokio::test]
    async fn sample_status_updates_derive_project_status() {
        let ydm = manager();
        ydm.create_project("P3", "doc-3", "Proj", "SmartSeq 3", None, true)
            .await
            .unwrap();
        ydm.add_sample("P3", "P3_1", SampleStatus::Initialized, &[])
            .await
            .unwrap();
        ydm.update_sample_status("P3", "P3_1", SampleStatus::Completed)
            .await
            .unwrap();

        let doc = ydm.get_document("P3").await.unwrap();
        assert_eq!(doc.project_status, ProjectStatus::Completed);
        assert!(!doc.get_sample("P3_1").unwrap().end_time.is_empty());
    }

    #[tokio::test]
    async fn invalid_ngi_report_is_rejected() {
        let ydm = manager();
        ydm.create_project("P4", "doc-4", "Proj", "SmartSeq 3", None, true)
            .await
            .unwrap();
        let result = ydm
            .add_ngi_report_entry("P4", &json!({"file_name": "only_this.html"}))
            .await;
        assert!(matches!(result, Err(DbError::Document(_))));
        assert!(ydm.get_document("P4").await.unwrap().ngi_report.is_empty());
    }
}
