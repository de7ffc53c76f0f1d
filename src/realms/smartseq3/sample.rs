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

/// One SmartSeq3 sample: owns its barcode and latest flowcell, builds its
/// zUMIs job script during pre-processing, and books its own outcome.
pub struct SS3Sample {
    core: SampleCore,
    sample_data: Value,
    config: Config,
    hpc: Arc<dyn JobManager>,
    project_dir: Option<PathBuf>,
    barcode: Option<String>,
    flowcell_id: Option<String>,
}

impl SS3Sample {
    pub fn new(
        sample_id: &str,
        sample_data: Value,
        project_id: &str,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
        config: Config,
        project_dir: Option<PathBuf>,
    ) -> Self {
        let barcode = extract_barcode(&sample_data);
        let flowcell_id = latest_flowcell(&sample_data);
        Self {
            core: SampleCore::new(sample_id, project_id, ydm, SampleStatus::Initialized),
            sample_data,
            config,
            hpc,
            project_dir,
            barcode,
            flowcell_id,
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

    fn script_args(&self, sample_dir: &Path) -> Option<HashMap<String, String>> {
        let barcode = self.barcode.clone()?;
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
        args.insert("barcode".to_string(), barcode);
        if let Some(reads) = self
            .sample_data
            .get("details")
            .and_then(|details| details.get("total_reads_(m)"))
        {
            args.insert("total_reads".to_string(), reads.to_string());
        }
        Some(args)
    }

    /// Collect metadata and write the job script. Ends in `pre_processed` on
    /// success, `pre_processing_failed` on any missing piece.
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

        let Some(args) = self.script_args(&sample_dir) else {
            error!(
                "[{}] Metadata missing. Pre-processing failed.",
                self.core.id()
            );
            self.core
                .set_status(SampleStatus::PreProcessingFailed)
                .await;
            return;
        };

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
impl RealmSample for SS3Sample {
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
        self.flowcell_id.iter().cloned().collect()
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

        // Book the flowcell this run covered; the insert is idempotent.
        if let Some(flowcell) = &self.flowcell_id {
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

fn extract_barcode(sample_data: &Value) -> Option<String> {
    let barcode = sample_data
        .get("library_prep")?
        .get("A")?
        .get("barcode")?
        .as_str()?;
    // LIMS writes barcodes as `<plate>-<well>`; only the well part goes into
    // the bench scripts.
    barcode.rsplit('-').next().map(str::to_string)
}

/// The latest flowcell the sample was sequenced on. Flowcell ids start with
/// the run date, so lexicographic order is chronological order.
fn latest_flowcell(sample_data: &Value) -> Option<String> {
    let preps = sample_data.get("library_prep")?.as_object()?;
    preps
        .values()
        .filter_map(|prep| prep.get("sequenced_fc"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(Value::as_str)
        .max()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn barcode_takes_the_well_part() {
        let data = json!({"library_prep": {"A": {"barcode": "SS3-A4"}}});
        assert_eq!(extract_barcode(&data).as_deref(), Some("A4"));
        assert_eq!(extract_barcode(&json!({})), None);
    }

    #[test]
    fn latest_flowcell_wins_across_preps() {
        let data = json!({
            "library_prep": {
                "A": {"sequenced_fc": ["240101_A00187_FCA", "240315_A00187_FCB"]},
                "B": {"sequenced_fc": ["240201_A00187_FCC"]},
            }
        });
        assert_eq!(
            latest_flowcell(&data).as_deref(),
            Some("240315_A00187_FCB")
        );
        assert_eq!(latest_flowcell(&json!({"library_prep": {}})), None);
    }
}
