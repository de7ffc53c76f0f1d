use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hpc::{JobManager, JobVerdict, classify_status, conclude_job};
use crate::realm::RealmSample;

const DEFAULT_POLL_INTERVAL: f64 = 10.0;
const DEFAULT_COMMAND_TIMEOUT: f64 = 8.0;

/// Manages the submission and monitoring of Slurm jobs. The submit and
/// status programs are configurable so the scheduler front-end stays an
/// opaque pair of commands.
pub struct SlurmJobManager {
    poll_interval: Duration,
    command_timeout: Duration,
    submit_program: String,
    status_program: String,
    cancel: CancellationToken,
}

impl SlurmJobManager {
    pub fn new(poll_interval: Duration, command_timeout: Duration) -> Self {
        Self {
            poll_interval,
            command_timeout,
            submit_program: "sbatch".to_string(),
            status_program: "sacct".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut manager = Self::new(
            Duration::from_secs_f64(
                config
                    .f64_at("job_monitor_poll_interval")
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
            ),
            Duration::from_secs_f64(
                config
                    .f64_at("job_command_timeout")
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            ),
        );
        manager.submit_program = config.str_or("hpc.submit_command", "sbatch");
        manager.status_program = config.str_or("hpc.status_command", "sacct");
        manager
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn run_command(&self, program: &str, args: &[&str]) -> Option<std::process::Output> {
        let mut command = Command::new(program);
        command.args(args);
        match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(err)) => {
                error!("Failed to run '{program}': {err}");
                None
            }
            Err(_) => {
                error!("Timeout while running '{program}'.");
                None
            }
        }
    }

    async fn job_status(&self, job_id: &str) -> Option<String> {
        let output = self
            .run_command(
                &self.status_program,
                &["-n", "-X", "-o", "State", "-j", job_id],
            )
            .await?;

        if !output.stderr.is_empty() {
            error!(
                "{} stderr: {}",
                self.status_program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("{} stdout for job {job_id}: {}", self.status_program, stdout.trim());
        stdout
            .split_whitespace()
            .next()
            .map(str::to_string)
    }
}

#[async_trait]
impl JobManager for SlurmJobManager {
    async fn submit_job(&self, script_path: &Path) -> Option<String> {
        if !script_path.is_file() {
            error!("Script file does not exist: {}", script_path.display());
            return None;
        }

        let script = script_path.to_string_lossy();
        let output = self
            .run_command(&self.submit_program, &[script.as_ref()])
            .await?;

        if !output.status.success() {
            error!(
                "Error submitting job. Details: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_job_id(&stdout) {
            Some(job_id) => {
                info!("Job submitted with ID: {job_id}");
                Some(job_id)
            }
            None => {
                error!(
                    "Failed to parse job ID from submit output: {}",
                    stdout.trim()
                );
                None
            }
        }
    }

    async fn monitor_job(&self, job_id: &str, sample: &dyn RealmSample) {
        debug!("[{}] Job {job_id} submitted for monitoring.", sample.id());
        loop {
            if let Some(token) = self.job_status(job_id).await {
                match classify_status(&token) {
                    JobVerdict::InFlight => {}
                    verdict => {
                        conclude_job(job_id, verdict, sample).await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(
                        "[{}] Monitoring of job {job_id} cancelled before completion.",
                        sample.id()
                    );
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Job ids appear in the submit output either in the classic
/// `Submitted batch job <id>` banner or bare; take the banner capture when
/// present, otherwise the first contiguous digit run.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    static BANNER: OnceLock<Regex> = OnceLock::new();
    static DIGITS: OnceLock<Regex> = OnceLock::new();

    let banner = BANNER.get_or_init(|| Regex::new(r"Submitted batch job (\d+)").unwrap());
    if let Some(captures) = banner.captures(stdout) {
        return Some(captures[1].to_string());
    }

    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap());
    digits.find(stdout).map(|m| m.as_str().to_string())
}
