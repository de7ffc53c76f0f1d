use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::error;
use serde_json::json;
use yggdrasil_db::{SampleStatus, YggdrasilDbManager};

/// The contract the lifecycle template and the HPC job manager consume from
/// realm-specific samples. Status and job-id writes persist to the yggdrasil
/// database; the `merge_*` variants only refresh the in-memory copy and exist
/// for reloading state the database already holds.
#[async_trait]
pub trait RealmSample: Send + Sync {
    fn id(&self) -> &str;
    fn status(&self) -> SampleStatus;
    async fn set_status(&self, status: SampleStatus);
    fn merge_status(&self, status: SampleStatus);

    fn job_id(&self) -> Option<String>;
    async fn set_job_id(&self, job_id: &str);
    fn merge_job_id(&self, job_id: &str);

    /// Flowcells this sample's data comes from, recorded at registration.
    fn flowcell_ids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Submit this sample's job and leave the sample in `auto-submitted`
    /// (or `processing_failed` when no job id could be obtained).
    async fn submit_job(&self);

    /// Drive a `processed` sample to `completed` or `post_processing_failed`.
    async fn post_process(&self);
}

/// Shared plumbing for realm samples: identity plus the interior-mutable
/// status/job-id pair with database persistence.
pub struct SampleCore {
    id: String,
    project_id: String,
    ydm: Arc<YggdrasilDbManager>,
    status: Mutex<SampleStatus>,
    job_id: Mutex<String>,
}

impl SampleCore {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        ydm: Arc<YggdrasilDbManager>,
        status: SampleStatus,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            ydm,
            status: Mutex::new(status),
            job_id: Mutex::new(String::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn ydm(&self) -> &Arc<YggdrasilDbManager> {
        &self.ydm
    }

    pub fn status(&self) -> SampleStatus {
        *self.status.lock().unwrap()
    }

    pub async fn set_status(&self, status: SampleStatus) {
        *self.status.lock().unwrap() = status;
        if let Err(err) = self
            .ydm
            .update_sample_status(&self.project_id, &self.id, status)
            .await
        {
            error!(
                "[{}] Could not persist status '{status}' for sample '{}': {err}",
                self.project_id, self.id
            );
        }
    }

    pub fn merge_status(&self, status: SampleStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn job_id(&self) -> Option<String> {
        let job_id = self.job_id.lock().unwrap();
        if job_id.is_empty() {
            None
        } else {
            Some(job_id.clone())
        }
    }

    pub async fn set_job_id(&self, job_id: &str) {
        *self.job_id.lock().unwrap() = job_id.to_string();
        if let Err(err) = self
            .ydm
            .update_sample_field(&self.project_id, &self.id, "job_id", &json!(job_id))
            .await
        {
            error!(
                "[{}] Could not persist job id '{job_id}' for sample '{}': {err}",
                self.project_id, self.id
            );
        }
    }

    pub fn merge_job_id(&self, job_id: &str) {
        *self.job_id.lock().unwrap() = job_id.to_string();
    }
}
