use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;
use yggdrasil_db::{SampleStatus, YggdrasilDbManager};

use crate::config::Config;
use crate::hpc::JobManager;
use crate::hpc::script::generate_job_script;
use crate::realm::{RealmSample, SampleCore};

/// One 10X sample: staged into its own directory, processed as a single
/// cellranger job built from the configured template.
pub struct TenXSample {
    core: SampleCore,
    sample_data: Value,
    config: Config,
    hpc: Arc<dyn JobManager>,
    project_dir: Option<PathBuf>,
    flowcells: Vec<String>,
}

impl TenXSample {
    pub fn new(
        sample_id: &str,
        sample_data: Value,
        project_id: &str,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
        config: Config,
        project_dir: Option<PathBuf>,
    ) -> Self {
        let flowcells = sequenced_flowcells(&sample_data);
        Self {
            core: SampleCore::new(sample_id, project_id, ydm, SampleStatus::Initialized),
            sample_data,
            config,
            hpc,
            project_dir,
            flowcells,
        }
    }

    fn sample_dir(&self) -> Option<PathBuf> {
        self.project_dir
            .as_ref()
            .map(|dir| dir.join(self.core.id()))
    }

    fn script_path(&self) -> Option<PathBuf> {
        self.sample_dir()
            .map(|dir| dir.join(format!("{}_job.sh", self.core.id())))
    }

    fn script_args(&self, sample_dir: &Path) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert(
            "job_name".to_string(),
            format!("{}_{}", self.core.project_id(), self.core.id()),
        );
        args.insert("sample_id".to_string(), self.core.id().to_string());
        args.insert(
            "sample_dir".to_string(),
            sample_dir.to_string_lossy().to_string(),
        );
        if let Some(ref_genome) = self
            .sample_data
            .get("reference_genome")
            .and_then(Value::as_str)
        {
            args.insert("ref_genome".to_string(), ref_genome.to_string());
        }
        args
    }

    pub async fn pre_process(&self) {
        info!("[{}] Pre-processing...", self.core.id());
        self.core.set_status(SampleStatus::PreProcessing).await;

        let Some(sample_dir) = self.sample_dir() else {
            error!(
                "[{}] No project directory available. Pre-processing failed.",
                self.core.id()
            );
            self.core
                .set_status(SampleStatus::PreProcessingFailed)
                .await;
            return;
        };
        if let Err(err) = std::fs::create_dir_all(&sample_dir) {
            error!(
                "[{}] Could not create sample directory: {err}",
                self.core.id()
            );
            self.core
                .set_status(SampleStatus::PreProcessingFailed)
                .await;
            return;
        }

        let template = self.config.str_or("job_template", "");
        if template.is_empty() {
            error!(
                "[{}] No job template configured. Pre-processing failed.",
                self.core.id()
            );
            self.core
                .set_status(SampleStatus::PreProcessingFailed)
                .await;
            return;
        }

        let script_path = sample_dir.join(format!("{}_job.sh", self.core.id()));
        let args = self.script_args(&sample_dir);
        if let Err(err) = generate_job_script(&args, Path::new(&template), &script_path) {
            error!("[{}] Failed to create job script: {err}", self.core.id());
            self.core
                .set_status(SampleStatus::PreProcessingFailed)
                .await;
            return;
        }
        debug!("[{}] Job script created.", self.core.id());

        self.core.set_status(SampleStatus::PreProcessed).await;
    }
}

#[async_trait]
impl RealmSample for TenXSample {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn status(&self) -> SampleStatus {
        self.core.status()
    }

    async fn set_status(&self, status: SampleStatus) {
        self.core.set_status(status).await;
    }

    fn merge_status(&self, status: SampleStatus) {
        self.core.merge_status(status);
    }

    fn job_id(&self) -> Option<String> {
        self.core.job_id()
    }

    async fn set_job_id(&self, job_id: &str) {
        self.core.set_job_id(job_id).await;
    }

    fn merge_job_id(&self, job_id: &str) {
        self.core.merge_job_id(job_id);
    }

    fn flowcell_ids(&self) -> Vec<String> {
        self.flowcells.clone()
    }

    async fn submit_job(&self) {
        info!("[{}] Submitting job...", self.core.id());
        let Some(script_path) = self.script_path() else {
            error!("[{}] No job script available.", self.core.id());
            self.core.set_status(SampleStatus::ProcessingFailed).await;
            return;
        };

        match self.hpc.submit_job(&script_path).await {
            Some(job_id) => {
                debug!("[{}] Job submitted with ID: {job_id}", self.core.id());
                self.core.set_job_id(&job_id).await;
                self.core.set_status(SampleStatus::AutoSubmitted).await;
            }
            None => {
                error!("[{}] Failed to submit job.", self.core.id());
                self.core.set_status(SampleStatus::ProcessingFailed).await;
            }
        }
    }

    async fn post_process(&self) {
        info!("[{}] Post-processing...", self.core.id());
        self.core.set_status(SampleStatus::PostProcessing).await;

        for flowcell in &self.flowcells {
            let _ = self
                .core
                .ydm()
                .add_flowcell_processed(self.core.project_id(), self.core.id(), flowcell)
                .await;
        }

        let output_present = self
            .sample_dir()
            .map(|dir| dir.exists())
            .unwrap_or(false);
        if output_present {
            self.core.set_status(SampleStatus::Completed).await;
        } else {
            error!(
                "[{}] Expected output directory is missing. Post-processing failed.",
                self.core.id()
            );
            self.core
                .set_status(SampleStatus::PostProcessingFailed)
                .await;
        }
    }
}

fn sequenced_flowcells(sample_data: &Value) -> Vec<String> {
    sample_data
        .get("library_prep")
        .and_then(Value::as_object)
        .map(|preps| {
            preps
                .values()
                .filter_map(|prep| prep.get("sequenced_fc"))
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
