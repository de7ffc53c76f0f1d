pub mod sample;
pub mod state;

pub use sample::{RealmSample, SampleCore};
pub use state::RealmState;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use itertools::Itertools;
use log::{error, info, warn};
use serde_json::Value;
use yggdrasil_db::{ProjectStatus, SampleStatus};

use crate::session::YggSession;

/// The contract a realm implements, plus the lifecycle template that drives
/// it. Realms supply the domain hooks (`check_required_fields`,
/// `extract_samples`, `pre_process_samples`); the template and the remaining
/// defaults are shared. `launch_template` is the entry point handlers call
/// and is normally not overridden.
#[async_trait]
pub trait RealmProject: Send + Sync {
    fn state(&self) -> &RealmState;
    fn state_mut(&mut self) -> &mut RealmState;

    fn project_id(&self) -> &str {
        &self.state().project_id
    }

    /// Gate evaluated by the handler before launching the lifecycle.
    fn proceed(&self) -> bool {
        self.state().proceed
    }

    /// Field-presence check over the upstream project document.
    fn check_required_fields(&self) -> bool;

    /// Build the realm's sample entities from the upstream document into
    /// `state.samples`. Samples aborted upstream must be filtered out here;
    /// they are never registered.
    async fn extract_samples(&mut self);

    /// Bring every extracted sample to `pre_processed` (or a pre-processing
    /// failure status). Samples that do not end up `pre_processed` take no
    /// further part in this pass.
    async fn pre_process_samples(&mut self);

    async fn submit_sample_jobs(&self) {
        let ready: Vec<_> = self
            .state()
            .samples
            .iter()
            .filter(|sample| sample.status() == SampleStatus::PreProcessed)
            .cloned()
            .collect();
        if ready.is_empty() {
            warn!("[{}] No samples to submit.", self.project_id());
            return;
        }

        info!("[{}] Submitting sample jobs...", self.project_id());
        join_all(ready.iter().map(|sample| sample.submit_job())).await;

        let failed: Vec<_> = ready
            .iter()
            .filter(|sample| sample.status() == SampleStatus::ProcessingFailed)
            .map(|sample| sample.id().to_string())
            .collect();
        if failed.is_empty() {
            info!("[{}] Sample jobs submitted.", self.project_id());
        } else {
            error!(
                "[{}] Some samples failed to submit: {failed:?}",
                self.project_id()
            );
        }
    }

    /// Await one monitor per in-flight sample. Each sample has at most one
    /// monitor; a failure in one never aborts the others.
    async fn monitor_hpc_jobs(&self) {
        let running: Vec<(String, Arc<dyn RealmSample>)> = self
            .state()
            .samples
            .iter()
            .filter(|sample| {
                matches!(
                    sample.status(),
                    SampleStatus::AutoSubmitted
                        | SampleStatus::ManuallySubmitted
                        | SampleStatus::Processing
                )
            })
            .filter_map(|sample| sample.job_id().map(|job_id| (job_id, sample.clone())))
            .collect();

        if running.is_empty() {
            info!("No HPC jobs to monitor for project {}.", self.project_id());
            return;
        }

        let hpc = self.state().hpc.clone();
        let monitors = running.iter().map(|(job_id, sample)| {
            info!("Monitoring HPC job {job_id} for sample {}...", sample.id());
            hpc.monitor_job(job_id, sample.as_ref())
        });
        info!("Created {} monitoring tasks for HPC jobs.", running.len());
        join_all(monitors).await;
        info!("All HPC monitoring tasks completed.");
    }

    /// Post-process samples that finished their HPC job, one at a time, and
    /// report anything that is in neither a finished nor a failed state.
    async fn post_process_samples(&self) {
        let processed: Vec<_> = self
            .state()
            .samples
            .iter()
            .filter(|sample| sample.status() == SampleStatus::Processed)
            .cloned()
            .collect();

        if processed.is_empty() {
            info!("No samples in 'processed' => skipping post-process.");
        } else {
            info!("Post-processing {} samples.", processed.len());
            for sample in &processed {
                let old_status = sample.status();
                sample.post_process().await;
                info!(
                    "Sample {} status went from '{old_status}' to '{}'.",
                    sample.id(),
                    sample.status()
                );
            }
        }

        let failed: Vec<_> = self
            .state()
            .samples
            .iter()
            .filter(|sample| sample.status() == SampleStatus::PostProcessingFailed)
            .collect();
        if !failed.is_empty() {
            warn!("Post-processing failed for {} samples:", failed.len());
            for sample in &failed {
                warn!(" - Sample {} failed post-processing.", sample.id());
            }
        }

        let leftover: Vec<_> = self
            .state()
            .samples
            .iter()
            .filter(|sample| {
                !matches!(
                    sample.status(),
                    SampleStatus::Completed | SampleStatus::PostProcessingFailed
                )
            })
            .collect();
        if !leftover.is_empty() {
            info!("Some samples were not post-processed due to their status:");
            for sample in &leftover {
                info!(" - Sample {} is '{}'", sample.id(), sample.status());
            }
        }

        info!("Post-process step complete.");
    }

    /// Wrap up the project. The project only closes when every sample
    /// reached a finished state; with failures in the mix the derived status
    /// (`partially_completed`) stands and a later pass may still finish the
    /// job. Realms override this when completion routes through an extra
    /// stage (e.g. a QC review).
    async fn finalize_project(&mut self) {
        let all_finished = !self.state().samples.is_empty()
            && self
                .state()
                .samples
                .iter()
                .all(|sample| sample.status().is_finished());
        if all_finished {
            self.state_mut()
                .set_project_status(ProjectStatus::Completed)
                .await;
        } else {
            info!(
                "[{}] Not all samples finished; leaving the derived project status in place.",
                self.project_id()
            );
        }
    }

    /// Reload each sample's job id and status from the yggdrasil database
    /// into the in-memory objects. The database copy wins on disagreement;
    /// this is how manually submitted job ids reach the monitors.
    async fn fetch_and_merge_sample_info_from_db(&self) {
        info!("[{}] Fetching and merging sample info.", self.project_id());
        let Some(document) = self.state().ydm.get_document(self.project_id()).await else {
            error!(
                "[{}] Cannot fetch the project document. Merge aborted.",
                self.project_id()
            );
            return;
        };

        for sample in &self.state().samples {
            let Some(record) = document.get_sample(sample.id()) else {
                warn!(
                    "Sample '{}' not found in the stored document. Skipping.",
                    sample.id()
                );
                continue;
            };
            if !record.job_id.is_empty() {
                sample.merge_job_id(&record.job_id);
            }
            if record.status != sample.status() {
                info!(
                    "Updating sample '{}' status from '{}' to '{}' based on the database.",
                    sample.id(),
                    sample.status(),
                    record.status
                );
                sample.merge_status(record.status);
            }
        }
        info!(
            "Merged HPC info for {} samples from the database.",
            self.state().samples.len()
        );
    }

    /// The lifecycle state machine. Routes on the persisted project status;
    /// every pass leaves the project in a state a later event can pick up.
    async fn launch_template(&mut self) {
        match self.state().project_status {
            ProjectStatus::Pending => self.handle_main_flow().await,
            ProjectStatus::ManuallySubmittedSamples => {
                self.handle_manually_submitted_flow().await
            }
            ProjectStatus::Completed => {
                info!(
                    "Project {} is already completed. Nothing to do.",
                    self.project_id()
                );
            }
            other => {
                warn!(
                    "Project {} in unknown status '{other}'. Skipping.",
                    self.project_id()
                );
            }
        }
    }

    async fn handle_main_flow(&mut self) {
        info!("[{}] Handling main flow for project.", self.project_id());

        self.extract_samples().await;
        if self.state().samples.is_empty() {
            warn!("No samples found => nothing to do.");
            return;
        }
        self.register_samples_in_db().await;

        self.pre_process_samples().await;
        let ready = self
            .state()
            .samples
            .iter()
            .filter(|sample| sample.status() == SampleStatus::PreProcessed)
            .count();
        if ready == 0 {
            warn!("No samples left after pre-processing => nothing to do.");
            return;
        }

        let auto_submit = self
            .state()
            .doc
            .get("pipeline_info")
            .and_then(|info| info.get("submit"))
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if auto_submit && !YggSession::is_manual_submit() {
            info!("Auto-submitting HPC jobs for all samples.");
            self.submit_sample_jobs().await;
            self.monitor_hpc_jobs().await;

            let finished = self
                .state()
                .samples
                .iter()
                .filter(|sample| sample.status() == SampleStatus::Processed)
                .map(|sample| sample.id().to_string())
                .collect_vec();
            info!("Samples that finished successfully: {finished:?}");

            self.post_process_samples().await;
            self.finalize_project().await;
        } else {
            info!("Manual submission required => no HPC submission now.");
            self.state_mut()
                .set_project_status(ProjectStatus::ManuallySubmittedSamples)
                .await;
        }
    }

    /// Jobs were submitted outside of Yggdrasil; pick up their ids from the
    /// database, monitor them, and finish the project as usual.
    async fn handle_manually_submitted_flow(&mut self) {
        info!(
            "Handling 'manually_submitted_samples' flow for project {}.",
            self.project_id()
        );

        self.extract_samples().await;
        if self.state().samples.is_empty() {
            warn!("No samples found => nothing to do.");
            return;
        }

        self.fetch_and_merge_sample_info_from_db().await;
        self.monitor_hpc_jobs().await;

        let finished = self
            .state()
            .samples
            .iter()
            .filter(|sample| sample.status() == SampleStatus::Processed)
            .map(|sample| sample.id().to_string())
            .collect_vec();
        info!("Samples that finished successfully: {finished:?}");

        self.post_process_samples().await;
        self.finalize_project().await;
    }

    /// Register the extracted samples; `add_sample` is idempotent so
    /// re-registration on a later pass merges instead of duplicating.
    async fn register_samples_in_db(&self) {
        for sample in &self.state().samples {
            let _ = self
                .state()
                .ydm
                .add_sample(
                    self.project_id(),
                    sample.id(),
                    sample.status(),
                    &sample.flowcell_ids(),
                )
                .await;
        }
    }
}
