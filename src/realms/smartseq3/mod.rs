pub mod sample;

pub use sample::SS3Sample;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use yggdrasil_db::{ProjectStatus, YggdrasilDbManager};

use crate::config::{Config, ConfigLoader};
use crate::hpc::JobManager;
use crate::realm::state::has_field;
use crate::realm::{RealmProject, RealmSample, RealmState};

/// The SmartSeq3 realm. Samples come out of the order's `samples` map, each
/// with a barcode and its latest flowcell; processing is one zUMIs job per
/// sample. Completion routes through a QC review instead of closing the
/// project directly.
pub struct SmartSeq3Project {
    state: RealmState,
    config: Config,
    project_dir: Option<PathBuf>,
    ss3_samples: Vec<Arc<SS3Sample>>,
}

impl SmartSeq3Project {
    pub async fn new(
        doc: Value,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
    ) -> Self {
        let config = ConfigLoader::load_config_optional("ss3_config.json");
        Self::with_config(doc, ydm, hpc, config).await
    }

    pub async fn with_config(
        doc: Value,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
        config: Config,
    ) -> Self {
        let state = RealmState::new(doc, ydm, hpc);
        let mut project = Self {
            state,
            config,
            project_dir: None,
            ss3_samples: Vec::new(),
        };

        project.state.proceed = project.check_required_fields();
        if !project.state.proceed {
            warn!(
                "[{}] Missing required fields => skipping.",
                project.state.project_id
            );
            return project;
        }

        project.state.initialize_project_in_db().await;
        if project.state.proceed {
            project.project_dir = project.ensure_project_directory();
        }
        project
    }

    fn ensure_project_directory(&self) -> Option<PathBuf> {
        let Some(root) = self.config.str_at("smartseq3_dir") else {
            warn!(
                "[{}] No 'smartseq3_dir' configured; samples cannot be staged.",
                self.state.project_id
            );
            return None;
        };
        let dir = PathBuf::from(root)
            .join("projects")
            .join(&self.state.project_name);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(err) => {
                error!(
                    "[{}] Could not create project directory '{}': {err}",
                    self.state.project_id,
                    dir.display()
                );
                None
            }
        }
    }

    fn required_fields(&self, key: &str) -> Vec<String> {
        self.config
            .array_at(key)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RealmProject for SmartSeq3Project {
    fn state(&self) -> &RealmState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RealmState {
        &mut self.state
    }

    fn check_required_fields(&self) -> bool {
        let missing: Vec<String> = self
            .required_fields("required_fields")
            .into_iter()
            .filter(|field| !has_field(&self.state.doc, field))
            .collect();
        if !missing.is_empty() {
            warn!("Missing required project information: {missing:?}.");
            return false;
        }

        let sample_required = self.required_fields("sample_required_fields");
        if let Some(samples) = self.state.doc.get("samples").and_then(Value::as_object) {
            for (sample_id, sample_data) in samples {
                for field in &sample_required {
                    if !has_field(sample_data, field) {
                        warn!(
                            "Missing required sample information '{field}' in sample '{sample_id}'."
                        );
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn extract_samples(&mut self) {
        self.ss3_samples.clear();
        self.state.samples.clear();

        let Some(samples) = self.state.doc.get("samples").and_then(Value::as_object) else {
            warn!(
                "[{}] Project document has no samples map.",
                self.state.project_id
            );
            return;
        };

        for (sample_id, sample_data) in samples {
            let manual_status = sample_data
                .get("details")
                .and_then(|details| details.get("status_(manual)"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if manual_status.eq_ignore_ascii_case("aborted") {
                info!("Skipping aborted sample {sample_id}.");
                continue;
            }

            let sample = Arc::new(SS3Sample::new(
                sample_id,
                sample_data.clone(),
                &self.state.project_id,
                self.state.ydm.clone(),
                self.state.hpc.clone(),
                self.config.clone(),
                self.project_dir.clone(),
            ));
            self.ss3_samples.push(sample);
        }

        self.state.samples = self
            .ss3_samples
            .iter()
            .map(|sample| sample.clone() as Arc<dyn RealmSample>)
            .collect();
        info!(
            "[{}] Extracted {} samples.",
            self.state.project_id,
            self.ss3_samples.len()
        );
    }

    async fn pre_process_samples(&mut self) {
        for sample in &self.ss3_samples {
            sample.pre_process().await;
        }
    }

    /// SmartSeq3 projects wait for a QC review before closing.
    async fn finalize_project(&mut self) {
        self.state
            .set_project_status(ProjectStatus::PendingQc)
            .await;
    }
}
