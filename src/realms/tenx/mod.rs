pub mod sample;

pub use sample::TenXSample;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use yggdrasil_db::YggdrasilDbManager;

use crate::config::{Config, ConfigLoader};
use crate::hpc::JobManager;
use crate::realm::state::has_field;
use crate::realm::{RealmProject, RealmSample, RealmState};

/// The 10X realm, covering the whole `10X ...` method family. Uses the
/// default finalization: the project closes as soon as its samples do.
pub struct TenXProject {
    state: RealmState,
    config: Config,
    project_dir: Option<PathBuf>,
    tenx_samples: Vec<Arc<TenXSample>>,
}

impl TenXProject {
    pub async fn new(
        doc: Value,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
    ) -> Self {
        let config = ConfigLoader::load_config_optional("tenx_config.json");
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
            tenx_samples: Vec::new(),
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
        let Some(root) = self.config.str_at("tenx_dir") else {
            warn!(
                "[{}] No 'tenx_dir' configured; samples cannot be staged.",
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
}

#[async_trait]
impl RealmProject for TenXProject {
    fn state(&self) -> &RealmState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RealmState {
        &mut self.state
    }

    fn check_required_fields(&self) -> bool {
        let required: Vec<&str> = self
            .config
            .array_at("required_fields")
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|field| !has_field(&self.state.doc, field))
            .collect();
        if !missing.is_empty() {
            warn!("Missing required project information: {missing:?}.");
            return false;
        }
        true
    }

    async fn extract_samples(&mut self) {
        self.tenx_samples.clear();
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

            let sample = Arc::new(TenXSample::new(
                sample_id,
                sample_data.clone(),
                &self.state.project_id,
                self.state.ydm.clone(),
                self.state.hpc.clone(),
                self.config.clone(),
                self.project_dir.clone(),
            ));
            self.tenx_samples.push(sample);
        }

        self.state.samples = self
            .tenx_samples
            .iter()
            .map(|sample| sample.clone() as Arc<dyn RealmSample>)
            .collect();
        info!(
            "[{}] Extracted {} samples.",
            self.state.project_id,
            self.tenx_samples.len()
        );
    }

    async fn pre_process_samples(&mut self) {
        for sample in &self.tenx_samples {
            sample.pre_process().await;
        }
    }
}
