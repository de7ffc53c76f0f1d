pub mod mock;
pub mod script;
pub mod slurm;

pub use mock::MockJobManager;
pub use slurm::SlurmJobManager;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use yggdrasil_db::SampleStatus;

use crate::config::Config;
use crate::realm::RealmSample;

/// Submits job scripts to the batch scheduler and drives a sample to a
/// terminal state from the job's outcome. Stateless beyond per-call locals;
/// any number of monitors may run concurrently as long as each sample has at
/// most one.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Returns the scheduler job id, or `None` on any submission failure
    /// (missing script, command timeout, nonzero exit, unparseable output).
    async fn submit_job(&self, script_path: &Path) -> Option<String>;

    /// Poll the job until it reaches a terminal status, then conclude the
    /// sample. Cancellation is honoured between polls.
    async fn monitor_job(&self, job_id: &str, sample: &dyn RealmSample);
}

/// What a scheduler status token means for the monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVerdict {
    Completed,
    Failed,
    /// Recognised non-terminal tokens and anything unexpected: keep polling.
    InFlight,
}

/// `OUT_OF_ME+` is the truncated form sacct uses for OUT_OF_MEMORY.
pub fn classify_status(token: &str) -> JobVerdict {
    match token {
        "COMPLETED" => JobVerdict::Completed,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_ME+" => JobVerdict::Failed,
        _ => JobVerdict::InFlight,
    }
}

/// Terminal-state bookkeeping shared by the real and the mock manager: a
/// completed job marks the sample `processed` and post-processes it, anything
/// else terminal marks it `processing_failed`.
pub(crate) async fn conclude_job(job_id: &str, verdict: JobVerdict, sample: &dyn RealmSample) {
    match verdict {
        JobVerdict::Completed => {
            info!("[{}] Job {job_id} completed successfully.", sample.id());
            sample.set_status(SampleStatus::Processed).await;
            sample.post_process().await;
        }
        JobVerdict::Failed => {
            sample.set_status(SampleStatus::ProcessingFailed).await;
            info!("[{}] Job {job_id} failed.", sample.id());
        }
        JobVerdict::InFlight => {
            warn!(
                "[{}] Job {job_id} concluded while still in flight.",
                sample.id()
            );
            sample.set_status(SampleStatus::ProcessingFailed).await;
        }
    }
}

/// Pick the job manager for this process: the mock in dev mode, Slurm
/// otherwise.
pub fn manager_for(dev: bool, config: &Config) -> Arc<dyn JobManager> {
    if dev {
        Arc::new(MockJobManager::new())
    } else {
        Arc::new(SlurmJobManager::from_config(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_tokens_are_classified() {
        assert_eq!(classify_status("COMPLETED"), JobVerdict::Completed);
        assert_eq!(classify_status("FAILED"), JobVerdict::Failed);
        assert_eq!(classify_status("CANCELLED"), JobVerdict::Failed);
        assert_eq!(classify_status("TIMEOUT"), JobVerdict::Failed);
        assert_eq!(classify_status("OUT_OF_ME+"), JobVerdict::Failed);
    }

    #[test]
    fn non_terminal_and_unknown_tokens_keep_polling() {
        assert_eq!(classify_status("PENDING"), JobVerdict::InFlight);
        assert_eq!(classify_status("RUNNING"), JobVerdict::InFlight);
        assert_eq!(classify_status("COMPLETING"), JobVerdict::InFlight);
        assert_eq!(classify_status("REQUEUED"), JobVerdict::InFlight);
        assert_eq!(classify_status(""), JobVerdict::InFlight);
    }
}
