use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;

use crate::hpc::{JobManager, JobVerdict, classify_status, conclude_job};
use crate::realm::RealmSample;

/// Development stand-in for the Slurm manager: submission always succeeds
/// with a synthetic job id, and the job flips to COMPLETED after a random
/// delay. Selected at session init time through the dev-mode flag.
pub struct MockJobManager {
    poll_interval: Duration,
    delay_range: Range<f64>,
    jobs: Arc<Mutex<HashMap<String, &'static str>>>,
}

impl MockJobManager {
    pub fn new() -> Self {
        Self::with_timings(Duration::from_secs(1), 15.0..35.0)
    }

    /// Tests shrink the delay range so scenarios run in milliseconds.
    pub fn with_timings(poll_interval: Duration, delay_range: Range<f64>) -> Self {
        Self {
            poll_interval,
            delay_range,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MockJobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobManager for MockJobManager {
    async fn submit_job(&self, script_path: &Path) -> Option<String> {
        let job_id = format!("{:04}", rand::thread_rng().gen_range(0..10_000));
        debug!(
            "Mock-submitting '{}' as job {job_id}",
            script_path.display()
        );
        self.jobs.lock().unwrap().insert(job_id.clone(), "PENDING");

        // Simulate the scheduler picking the job up later.
        let wait = Duration::from_secs_f64(
            rand::thread_rng().gen_range(self.delay_range.clone()),
        );
        let jobs = Arc::clone(&self.jobs);
        let finished_job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            jobs.lock().unwrap().insert(finished_job_id, "COMPLETED");
        });

        Some(job_id)
    }

    async fn monitor_job(&self, job_id: &str, sample: &dyn RealmSample) {
        loop {
            let token = self.jobs.lock().unwrap().get(job_id).copied();
            match token {
                Some(token) => match classify_status(token) {
                    JobVerdict::InFlight => {}
                    verdict => {
                        info!("[{}] Job {job_id} status: {token}", sample.id());
                        conclude_job(job_id, verdict, sample).await;
                        return;
                    }
                },
                None => {
                    // A job this manager never submitted; nothing will ever
                    // complete it, so fail the sample instead of spinning.
                    warn!(
                        "[{}] Job {job_id} is unknown to the mock manager.",
                        sample.id()
                    );
                    conclude_job(job_id, JobVerdict::Failed, sample).await;
                    return;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
