use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("sample '{0}' not found")]
    SampleNotFound(String),

    #[error("invalid NGI report entry")]
    InvalidReportEntry(#[source] serde_json::Error),

    #[error("unsupported sample field '{0}'")]
    UnsupportedField(String),

    #[error("invalid value for sample field '{field}'")]
    InvalidFieldValue { field: String },
}

/// Sample lifecycle markers. The serialized strings are part of the external
/// database schema; renames here are schema changes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SampleStatus {
    Pending,
    Unsequenced,
    Initialized,
    PreProcessing,
    PreProcessed,
    PreProcessingFailed,
    RequiresManualSubmission,
    #[serde(rename = "auto-submitted")]
    #[strum(serialize = "auto-submitted")]
    AutoSubmitted,
    ManuallySubmitted,
    Processing,
    Processed,
    ProcessingFailed,
    PostProcessing,
    Completed,
    PostProcessingFailed,
    Aborted,
}

impl SampleStatus {
    /// Sample is being worked on right now.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SampleStatus::Initialized
                | SampleStatus::Processing
                | SampleStatus::PreProcessing
                | SampleStatus::PostProcessing
                | SampleStatus::RequiresManualSubmission
        )
    }

    /// Sample reached a final outcome that counts towards project completion.
    pub fn is_finished(self) -> bool {
        matches!(self, SampleStatus::Completed | SampleStatus::Aborted)
    }

    pub fn is_not_started(self) -> bool {
        matches!(self, SampleStatus::Pending | SampleStatus::Unsequenced)
    }

    /// Terminal statuses stamp `end_time` on entry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SampleStatus::Completed
                | SampleStatus::Aborted
                | SampleStatus::PreProcessingFailed
                | SampleStatus::ProcessingFailed
                | SampleStatus::PostProcessingFailed
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Processing,
    PartiallyCompleted,
    Completed,
    ManuallySubmittedSamples,
    #[serde(rename = "pending_QC")]
    #[strum(serialize = "pending_QC")]
    PendingQc,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }
}

/// QC verdicts are written by the reviewing UI, never by the engine itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum QcStatus {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unset,
    Pending,
    Passed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContact {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub sample_id: String,
    pub status: SampleStatus,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub flowcell_ids_processed_for: Vec<String>,
    #[serde(default, rename = "QC")]
    pub qc: QcStatus,
    #[serde(default)]
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgiReportEntry {
    pub file_name: String,
    pub date_created: String,
    pub signee: String,
    pub date_signed: String,
    pub rejected: bool,
    pub samples_included: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEntry {
    pub dds_project_id: String,
    pub date_uploaded: String,
    #[serde(default)]
    pub date_released: String,
    pub samples_included: Vec<String>,
    pub total_volume: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryInfo {
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub delivery_results: Vec<DeliveryEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dds_project_id: String,
}

/// The per-project document persisted in the yggdrasil database. Project
/// status is derived from the samples after every sample mutation; the
/// mutating methods below are the only supported write paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YggdrasilDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub projects_reference: String,
    pub method: String,
    pub project_id: String,
    pub project_name: String,
    pub project_status: ProjectStatus,
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub delivery_info: DeliveryInfo,
    #[serde(default)]
    pub ngi_report: Vec<NgiReportEntry>,
    #[serde(default)]
    pub user_info: BTreeMap<String, UserContact>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl YggdrasilDocument {
    pub fn new(
        project_id: &str,
        projects_reference: &str,
        project_name: &str,
        method: &str,
    ) -> Self {
        Self {
            id: project_id.to_string(),
            rev: None,
            projects_reference: projects_reference.to_string(),
            method: method.to_string(),
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            project_status: ProjectStatus::Pending,
            start_date: now_iso(),
            end_date: String::new(),
            samples: Vec::new(),
            delivery_info: DeliveryInfo::default(),
            ngi_report: Vec::new(),
            user_info: BTreeMap::new(),
        }
    }

    pub fn get_sample(&self, sample_id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.sample_id == sample_id)
    }

    fn get_sample_mut(&mut self, sample_id: &str) -> Option<&mut Sample> {
        self.samples.iter_mut().find(|s| s.sample_id == sample_id)
    }

    pub fn sample_status(&self, sample_id: &str) -> Option<SampleStatus> {
        self.get_sample(sample_id).map(|s| s.status)
    }

    /// Add a sample, or merge into the existing one with the same id. Flowcell
    /// ids are set-unioned so registering the same sample twice is harmless.
    pub fn add_sample(&mut self, sample_id: &str, status: SampleStatus, flowcell_ids: &[String]) {
        let now = now_iso();
        if let Some(index) = self.samples.iter().position(|s| s.sample_id == sample_id) {
            let existing = &mut self.samples[index];
            for flowcell in flowcell_ids {
                if !existing.flowcell_ids_processed_for.contains(flowcell) {
                    existing.flowcell_ids_processed_for.push(flowcell.clone());
                }
            }
            apply_sample_status(existing, status, &now);
        } else {
            let mut sample = Sample {
                sample_id: sample_id.to_string(),
                status,
                job_id: String::new(),
                start_time: String::new(),
                end_time: String::new(),
                flowcell_ids_processed_for: flowcell_ids.to_vec(),
                qc: QcStatus::Unset,
                delivered: false,
            };
            apply_sample_status(&mut sample, status, &now);
            self.samples.push(sample);
        }
        self.derive_project_status();
    }

    pub fn update_sample_status(
        &mut self,
        sample_id: &str,
        status: SampleStatus,
    ) -> Result<(), DocumentError> {
        let now = now_iso();
        let sample = self
            .get_sample_mut(sample_id)
            .ok_or_else(|| DocumentError::SampleNotFound(sample_id.to_string()))?;
        apply_sample_status(sample, status, &now);
        self.derive_project_status();
        Ok(())
    }

    /// Generic field write used by external actors (e.g. recording a manually
    /// submitted job id). Status writes are routed through
    /// `update_sample_status` so the timestamp invariants hold.
    pub fn update_sample_field(
        &mut self,
        sample_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), DocumentError> {
        if field == "status" {
            let status: SampleStatus = serde_json::from_value(value.clone())
                .map_err(|_| DocumentError::InvalidFieldValue {
                    field: field.to_string(),
                })?;
            return self.update_sample_status(sample_id, status);
        }

        let sample = self
            .get_sample_mut(sample_id)
            .ok_or_else(|| DocumentError::SampleNotFound(sample_id.to_string()))?;
        match field {
            "job_id" => {
                sample.job_id = value
                    .as_str()
                    .ok_or_else(|| DocumentError::InvalidFieldValue {
                        field: field.to_string(),
                    })?
                    .to_string();
            }
            "QC" => {
                sample.qc = serde_json::from_value(value.clone()).map_err(|_| {
                    DocumentError::InvalidFieldValue {
                        field: field.to_string(),
                    }
                })?;
            }
            "delivered" => {
                sample.delivered =
                    value
                        .as_bool()
                        .ok_or_else(|| DocumentError::InvalidFieldValue {
                            field: field.to_string(),
                        })?;
            }
            other => return Err(DocumentError::UnsupportedField(other.to_string())),
        }
        self.derive_project_status();
        Ok(())
    }

    /// Idempotent: adding a flowcell id the sample already carries is a no-op.
    pub fn add_flowcell_processed(
        &mut self,
        sample_id: &str,
        flowcell_id: &str,
    ) -> Result<(), DocumentError> {
        let sample = self
            .get_sample_mut(sample_id)
            .ok_or_else(|| DocumentError::SampleNotFound(sample_id.to_string()))?;
        if !sample
            .flowcell_ids_processed_for
            .iter()
            .any(|f| f == flowcell_id)
        {
            sample
                .flowcell_ids_processed_for
                .push(flowcell_id.to_string());
        }
        Ok(())
    }

    pub fn set_sample_qc(&mut self, sample_id: &str, qc: QcStatus) -> Result<(), DocumentError> {
        let sample = self
            .get_sample_mut(sample_id)
            .ok_or_else(|| DocumentError::SampleNotFound(sample_id.to_string()))?;
        sample.qc = qc;
        Ok(())
    }

    pub fn mark_sample_delivered(&mut self, sample_id: &str) -> Result<(), DocumentError> {
        let sample = self
            .get_sample_mut(sample_id)
            .ok_or_else(|| DocumentError::SampleNotFound(sample_id.to_string()))?;
        sample.delivered = true;
        Ok(())
    }

    /// Re-derive the project status from the sample statuses:
    /// any active sample wins, then all-finished, then all-not-started,
    /// otherwise the project is partially completed. A project parked in
    /// `manually_submitted_samples` keeps that marker as long as a sample is
    /// still waiting on an external submission or on its monitor, because
    /// external actors (or the next pass) are still expected to act.
    pub fn derive_project_status(&mut self) {
        let any_active = self.samples.iter().any(|s| s.status.is_active());
        let all_finished =
            !self.samples.is_empty() && self.samples.iter().all(|s| s.status.is_finished());
        let all_not_started =
            !self.samples.is_empty() && self.samples.iter().all(|s| s.status.is_not_started());
        let awaiting_submission = self.samples.iter().any(|s| {
            matches!(
                s.status,
                SampleStatus::PreProcessed | SampleStatus::ManuallySubmitted
            )
        });

        let next = if self.samples.is_empty() {
            ProjectStatus::Pending
        } else if any_active {
            ProjectStatus::Processing
        } else if all_finished {
            ProjectStatus::Completed
        } else if self.project_status == ProjectStatus::ManuallySubmittedSamples
            && awaiting_submission
        {
            debug!(
                "[{}] Keeping status 'manually_submitted_samples' while samples are in flight",
                self.project_id
            );
            return;
        } else if all_not_started {
            ProjectStatus::Pending
        } else {
            ProjectStatus::PartiallyCompleted
        };
        self.update_project_status(next);
    }

    /// Set the project status directly. `end_date` is stamped once when a
    /// terminal status is entered and cleared again when it is left.
    pub fn update_project_status(&mut self, status: ProjectStatus) {
        self.project_status = status;
        if status.is_terminal() {
            if self.end_date.is_empty() {
                self.end_date = now_iso();
            }
        } else {
            self.end_date.clear();
        }
    }

    /// Append an NGI report record. All six keys must be present, otherwise
    /// the list is left untouched and the error is reported to the caller.
    pub fn add_ngi_report_entry(&mut self, entry: &Value) -> Result<(), DocumentError> {
        let entry: NgiReportEntry =
            serde_json::from_value(entry.clone()).map_err(DocumentError::InvalidReportEntry)?;
        self.ngi_report.push(entry);
        Ok(())
    }

    pub fn add_delivery_entry(&mut self, entry: DeliveryEntry) {
        self.delivery_info.delivery_results.push(entry);
    }

    pub fn delivery_status(&self) -> &str {
        &self.delivery_info.status
    }

    pub fn set_delivery_status(&mut self, status: &str) {
        self.delivery_info.status = status.to_string();
    }

    pub fn set_user_info(&mut self, updated: &BTreeMap<String, UserContact>) {
        for (role, contact) in updated {
            let entry = self.user_info.entry(role.clone()).or_default();
            if !contact.email.is_empty() {
                entry.email = contact.email.clone();
            }
            if !contact.name.is_empty() {
                entry.name = contact.name.clone();
            }
            for (key, value) in &contact.extra {
                entry.extra.insert(key.clone(), value.clone());
            }
        }
    }

    /// Refresh the mutable project metadata when a known project is observed
    /// again in the projects database.
    pub fn sync_project_metadata(
        &mut self,
        user_info: &BTreeMap<String, UserContact>,
        sensitive: bool,
    ) {
        self.set_user_info(user_info);
        if self.delivery_info.sensitive != sensitive {
            warn!(
                "[{}] Sensitive flag changed to {sensitive}",
                self.project_id
            );
        }
        self.delivery_info.sensitive = sensitive;
    }
}

fn apply_sample_status(sample: &mut Sample, status: SampleStatus, now: &str) {
    sample.status = status;
    if status.is_active() && sample.start_time.is_empty() {
        sample.start_time = now.to_string();
    }
    if status.is_terminal() {
        sample.end_time = now.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with(statuses: &[SampleStatus]) -> YggdrasilDocument {
        let mut doc = YggdrasilDocument::new("P1", "doc-1", "Test Project", "SmartSeq 3");
        for (i, status) in statuses.iter().enumerate() {
            doc.add_sample(&format!("P1_{}", i + 1), *status, &[]);
        }
        doc
    }

    #[test]
    fn empty_project_is_pending() {
        let doc = doc_with(&[]);
        assert_eq!(doc.project_status, ProjectStatus::Pending);
    }

    #[test]
    fn any_active_sample_means_processing() {
        let doc = doc_with(&[SampleStatus::Completed, SampleStatus::Processing]);
        assert_eq!(doc.project_status, ProjectStatus::Processing);
    }

    #[test]
    fn all_finished_means_completed_with_end_date() {
        let doc = doc_with(&[SampleStatus::Completed, SampleStatus::Aborted]);
        assert_eq!(doc.project_status, ProjectStatus::Completed);
        assert!(!doc.end_date.is_empty());
    }

    #[test]
    fn all_not_started_means_pending() {
        let doc = doc_with(&[SampleStatus::Pending, SampleStatus::Unsequenced]);
        assert_eq!(doc.project_status, ProjectStatus::Pending);
    }

    #[test]
    fn mixed_without_active_means_partially_completed() {
        let doc = doc_with(&[SampleStatus::Completed, SampleStatus::ProcessingFailed]);
        assert_eq!(doc.project_status, ProjectStatus::PartiallyCompleted);
        assert!(doc.end_date.is_empty());
    }

    #[test]
    fn leaving_completed_clears_end_date() {
        let mut doc = doc_with(&[SampleStatus::Completed]);
        assert!(!doc.end_date.is_empty());
        doc.add_sample("P1_2", SampleStatus::Initialized, &[]);
        assert_eq!(doc.project_status, ProjectStatus::Processing);
        assert!(doc.end_date.is_empty());
    }

    #[test]
    fn manually_submitted_marker_survives_sample_updates() {
        let mut doc = doc_with(&[SampleStatus::PreProcessed, SampleStatus::PreProcessed]);
        doc.update_project_status(ProjectStatus::ManuallySubmittedSamples);
        doc.update_sample_field("P1_1", "job_id", &json!("12345"))
            .unwrap();
        doc.update_sample_status("P1_1", SampleStatus::ManuallySubmitted)
            .unwrap();
        assert_eq!(
            doc.project_status,
            ProjectStatus::ManuallySubmittedSamples
        );

        // Once every sample is finished the derivation takes over again.
        doc.update_sample_status("P1_1", SampleStatus::Completed).unwrap();
        doc.update_sample_status("P1_2", SampleStatus::Completed).unwrap();
        assert_eq!(doc.project_status, ProjectStatus::Completed);
    }

    #[test]
    fn terminal_sample_statuses_stamp_end_time() {
        let mut doc = doc_with(&[SampleStatus::Pending]);
        doc.update_sample_status("P1_1", SampleStatus::Initialized).unwrap();
        let start = doc.get_sample("P1_1").unwrap().start_time.clone();
        assert!(!start.is_empty());

        doc.update_sample_status("P1_1", SampleStatus::ProcessingFailed).unwrap();
        let sample = doc.get_sample("P1_1").unwrap();
        assert!(!sample.end_time.is_empty());
        // start_time is only stamped on the first entry to an active status
        assert_eq!(sample.start_time, start);
    }

    #[test]
    fn add_sample_is_idempotent_and_merges_flowcells() {
        let mut doc = doc_with(&[]);
        doc.add_sample(
            "P1_1",
            SampleStatus::Pending,
            &["FC_A".to_string(), "FC_B".to_string()],
        );
        doc.add_sample(
            "P1_1",
            SampleStatus::Pending,
            &["FC_B".to_string(), "FC_C".to_string()],
        );
        assert_eq!(doc.samples.len(), 1);
        assert_eq!(
            doc.get_sample("P1_1").unwrap().flowcell_ids_processed_for,
            vec!["FC_A", "FC_B", "FC_C"]
        );
    }

    #[test]
    fn flowcell_insert_is_deduplicated() {
        let mut doc = doc_with(&[SampleStatus::Pending]);
        doc.add_flowcell_processed("P1_1", "FC_X").unwrap();
        doc.add_flowcell_processed("P1_1", "FC_X").unwrap();
        assert_eq!(
            doc.get_sample("P1_1").unwrap().flowcell_ids_processed_for,
            vec!["FC_X"]
        );
    }

    #[test]
    fn ngi_report_entry_requires_all_keys() {
        let mut doc = doc_with(&[]);
        let incomplete = json!({
            "file_name": "P1_ngi_report.html",
            "date_created": "2025-02-02_10:20:30",
            "signee": "",
            "date_signed": "",
            "rejected": false,
            // samples_included missing
        });
        assert!(doc.add_ngi_report_entry(&incomplete).is_err());
        assert!(doc.ngi_report.is_empty());

        let complete = json!({
            "file_name": "P1_ngi_report.html",
            "date_created": "2025-02-02_10:20:30",
            "signee": "",
            "date_signed": "",
            "rejected": false,
            "samples_included": ["P1_1"],
        });
        doc.add_ngi_report_entry(&complete).unwrap();
        assert_eq!(doc.ngi_report.len(), 1);
    }

    #[test]
    fn status_strings_match_the_external_schema() {
        assert_eq!(
            serde_json::to_value(SampleStatus::AutoSubmitted).unwrap(),
            json!("auto-submitted")
        );
        assert_eq!(
            serde_json::to_value(SampleStatus::PreProcessingFailed).unwrap(),
            json!("pre_processing_failed")
        );
        assert_eq!(
            serde_json::to_value(ProjectStatus::PendingQc).unwrap(),
            json!("pending_QC")
        );
        assert_eq!(serde_json::to_value(QcStatus::Unset).unwrap(), json!(""));
        assert_eq!(
            serde_json::from_value::<SampleStatus>(json!("manually_submitted")).unwrap(),
            SampleStatus::ManuallySubmitted
        );
    }

    #[test]
    fn document_round_trips_through_json() {
        let mut doc = doc_with(&[SampleStatus::Processing]);
        doc.update_sample_field("P1_1", "job_id", &json!("4711")).unwrap();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], json!("P1"));
        assert_eq!(value["samples"][0]["job_id"], json!("4711"));
        assert_eq!(value["samples"][0]["QC"], json!(""));
        let back: YggdrasilDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back.project_status, ProjectStatus::Processing);
        assert_eq!(back.get_sample("P1_1").unwrap().job_id, "4711");
    }

    #[test]
    fn unknown_sample_update_is_an_error() {
        let mut doc = doc_with(&[]);
        assert!(matches!(
            doc.update_sample_status("nope", SampleStatus::Completed),
            Err(DocumentError::SampleNotFound(_))
        ));
    }
}
