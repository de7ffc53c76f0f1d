use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info, warn};
use serde_json::Value;
use yggdrasil_db::YggdrasilDbManager;

use crate::handlers::EventHandler;
use crate::hpc::JobManager;
use crate::realms;

/// One async mutex per project id, so a second event for the same project
/// waits for the in-flight lifecycle pass instead of racing it. Passes for
/// different projects run independently.
#[derive(Default)]
struct ProjectLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    fn lock_for(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .unwrap()
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }
}

/// Handles projects-DB change events: validates the payload, builds the
/// realm the resolver picked, and runs its lifecycle. No failure propagates
/// out of here; everything becomes a log line tagged with the project id.
pub struct ProjectChangeHandler {
    ydm: Arc<YggdrasilDbManager>,
    hpc: Arc<dyn JobManager>,
    locks: ProjectLocks,
}

impl ProjectChangeHandler {
    pub fn new(ydm: Arc<YggdrasilDbManager>, hpc: Arc<dyn JobManager>) -> Self {
        Self {
            ydm,
            hpc,
            locks: ProjectLocks::default(),
        }
    }
}

#[async_trait]
impl EventHandler for ProjectChangeHandler {
    async fn handle_task(&self, payload: Value) {
        let Some(document) = payload.get("document").filter(|doc| doc.is_object()).cloned()
        else {
            warn!("handle_task: missing or invalid 'document' in payload");
            return;
        };
        let Some(module_location) = payload
            .get("module_location")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!("handle_task: missing or invalid 'module_location' in payload");
            return;
        };

        let project_id = document
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        info!("Processing projects-DB change for project {project_id} -> module {module_location}");

        // Serialize lifecycle passes per project.
        let lock = self.locks.lock_for(&project_id);
        let _guard = lock.lock().await;

        let Some(mut realm) = realms::build(
            &module_location,
            document,
            self.ydm.clone(),
            self.hpc.clone(),
        )
        .await
        else {
            error!("Cannot load realm '{module_location}' for project {project_id}");
            return;
        };

        if !realm.proceed() {
            info!("Realm skipped (proceed=false) for project {project_id}");
            return;
        }

        info!("Launching realm for project {project_id}");
        let outcome = std::panic::AssertUnwindSafe(realm.launch_template())
            .catch_unwind()
            .await;
        match outcome {
            Ok(()) => info!("Realm completed for project {project_id}"),
            Err(_) => error!("Error running realm for project {project_id}"),
        }
    }
}
