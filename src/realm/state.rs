use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info};
use serde_json::Value;
use yggdrasil_db::{ProjectStatus, UserContact, YggdrasilDbManager};

use crate::hpc::JobManager;
use crate::realm::sample::RealmSample;

/// The fields every realm project carries: the upstream document, the
/// handles it works through, its sample set, and the gate/status pair the
/// lifecycle template drives.
pub struct RealmState {
    pub doc: Value,
    pub project_id: String,
    pub doc_id: String,
    pub project_name: String,
    pub method: String,
    pub user_info: BTreeMap<String, UserContact>,
    pub is_sensitive: bool,
    pub ydm: Arc<YggdrasilDbManager>,
    pub hpc: Arc<dyn JobManager>,
    pub samples: Vec<Arc<dyn RealmSample>>,
    pub proceed: bool,
    pub project_status: ProjectStatus,
}

impl RealmState {
    pub fn new(doc: Value, ydm: Arc<YggdrasilDbManager>, hpc: Arc<dyn JobManager>) -> Self {
        let project_id = str_at(&doc, &["project_id"]).unwrap_or_default();
        let doc_id = str_at(&doc, &["_id"]).unwrap_or_default();
        let project_name = str_at(&doc, &["project_name"]).unwrap_or_default();
        let method = str_at(&doc, &["details", "library_construction_method"]).unwrap_or_default();
        let user_info = extract_user_info(&doc);
        // Sensitive unless the order explicitly says otherwise.
        let is_sensitive = !str_at(&doc, &["details", "sensitive_data"])
            .unwrap_or_default()
            .eq_ignore_ascii_case("no");

        Self {
            doc,
            project_id,
            doc_id,
            project_name,
            method,
            user_info,
            is_sensitive,
            ydm,
            hpc,
            samples: Vec::new(),
            proceed: false,
            project_status: ProjectStatus::Pending,
        }
    }

    /// Create the project document on first observation, or reload it and
    /// decide whether this pass should proceed. Completed projects are
    /// skipped; live ones get their mutable metadata re-synced.
    pub async fn initialize_project_in_db(&mut self) {
        if !self.ydm.project_exists(&self.project_id).await {
            let _ = self
                .ydm
                .create_project(
                    &self.project_id,
                    &self.doc_id,
                    &self.project_name,
                    &self.method,
                    Some(self.user_info.clone()),
                    self.is_sensitive,
                )
                .await;
            info!("Project {} created in the yggdrasil database.", self.project_id);
            self.project_status = ProjectStatus::Pending;
            self.proceed = true;
            return;
        }

        info!(
            "Project {} already exists in the yggdrasil database.",
            self.project_id
        );
        match self.ydm.get_document(&self.project_id).await {
            Some(document) => {
                self.project_status = document.project_status;
                if self.project_status == ProjectStatus::Completed {
                    info!(
                        "Project with ID {} is already completed. Skipping processing.",
                        self.project_id
                    );
                    self.proceed = false;
                } else {
                    info!(
                        "Project with ID {} has status '{}' and will be processed.",
                        self.project_id, self.project_status
                    );
                    self.proceed = true;
                    if let Err(err) = self
                        .ydm
                        .sync_project_metadata(&self.project_id, &self.user_info, self.is_sensitive)
                        .await
                    {
                        error!(
                            "[{}] Could not sync project metadata: {err}",
                            self.project_id
                        );
                    }
                }
            }
            None => {
                error!(
                    "Could not fetch the yggdrasil document for {}.",
                    self.project_id
                );
                self.proceed = false;
            }
        }
    }

    pub async fn set_project_status(&mut self, status: ProjectStatus) {
        self.project_status = status;
        // The wrapper logs both the success and any conflict; a dropped write
        // here is repaired by the next event's re-read.
        let _ = self.ydm.update_project_status(&self.project_id, status).await;
    }
}

/// True when the dotted path resolves to any value in the document.
pub fn has_field(doc: &Value, dotted_path: &str) -> bool {
    let mut current = doc;
    for key in dotted_path.split('.') {
        match current.get(key) {
            Some(next) => current = next,
            None => return false,
        }
    }
    true
}

fn str_at(doc: &Value, path: &[&str]) -> Option<String> {
    let mut current = doc;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::to_string)
}

fn contact(doc: &Value, email_path: &[&str], name_path: &[&str]) -> UserContact {
    UserContact {
        email: str_at(doc, email_path).unwrap_or_default(),
        name: str_at(doc, name_path).unwrap_or_default(),
        extra: BTreeMap::new(),
    }
}

/// Pull the role → contact map out of the order details. Roles with no data
/// still appear with empty fields, matching what delivery tooling expects.
fn extract_user_info(doc: &Value) -> BTreeMap<String, UserContact> {
    let mut user_info = BTreeMap::new();
    user_info.insert(
        "owner".to_string(),
        contact(
            doc,
            &["order_details", "owner", "email"],
            &["order_details", "owner", "name"],
        ),
    );
    user_info.insert(
        "bioinformatician".to_string(),
        contact(
            doc,
            &["order_details", "fields", "project_bx_email"],
            &["order_details", "fields", "project_bx_name"],
        ),
    );
    user_info.insert(
        "pi".to_string(),
        contact(
            doc,
            &["order_details", "fields", "project_pi_email"],
            &["order_details", "fields", "project_pi_name"],
        ),
    );
    user_info.insert(
        "lab".to_string(),
        contact(
            doc,
            &["order_details", "fields", "project_lab_email"],
            &["order_details", "fields", "project_lab_name"],
        ),
    );
    user_info
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_info_and_sensitivity_come_from_order_details() {
        let doc = json!({
            "project_id": "P77",
            "_id": "doc-77",
            "project_name": "N.Nyberg_25_01",
            "details": {
                "library_construction_method": "SmartSeq 3",
                "sensitive_data": "No",
            },
            "order_details": {
                "owner": {"email": "owner@host.org", "name": "Owner Name"},
                "fields": {
                    "project_pi_email": "pi@host.org",
                    "project_pi_name": "PI Name",
                },
            },
        });

        let info = extract_user_info(&doc);
        assert_eq!(info["owner"].email, "owner@host.org");
        assert_eq!(info["pi"].name, "PI Name");
        assert_eq!(info["lab"].email, "");

        let sensitive = !str_at(&doc, &["details", "sensitive_data"])
            .unwrap_or_default()
            .eq_ignore_ascii_case("no");
        assert!(!sensitive);

        // Missing flag means sensitive.
        let bare = json!({"details": {}});
        let sensitive = !str_at(&bare, &["details", "sensitive_data"])
            .unwrap_or_default()
            .eq_ignore_ascii_case("no");
        assert!(sensitive);
    }
}
