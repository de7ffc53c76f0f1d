use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use yggdrasil::config::Config;
use yggdrasil::handlers::{EventHandler, ProjectChangeHandler};
use yggdrasil::hpc::{JobManager, MockJobManager, SlurmJobManager};
use yggdrasil::realm::RealmProject;
use yggdrasil::realms::{SmartSeq3Project, TenXProject};
use yggdrasil_db::{MemoryBackend, ProjectStatus, SampleStatus, YggdrasilDbManager};

fn write_executable(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Stand-in scheduler: the submit command derives a deterministic job id
/// from the sample's script name and logs the submission; the status command
/// reports FAILED for one configurable job id and COMPLETED for the rest.
fn stub_scheduler(dir: &Path, fail_job: &str) -> Config {
    let submit = dir.join("submit.sh");
    let status = dir.join("status.sh");
    let submits_log = dir.join("submits.log");
    let polls_log = dir.join("polls.log");

    write_executable(
        &submit,
        &format!(
            "#!/bin/sh\n\
             echo \"$1\" >> {}\n\
             base=$(basename \"$1\" _job.sh)\n\
             num=$(echo \"$base\" | tr -cd '0-9')\n\
             echo \"Submitted batch job 9$num\"\n",
            submits_log.display()
        ),
    );
    write_executable(
        &status,
        &format!(
            "#!/bin/sh\n\
             echo \"$6\" >> {}\n\
             if [ \"$6\" = \"{fail_job}\" ]; then echo \"FAILED\"; else echo \"COMPLETED\"; fi\n",
            polls_log.display()
        ),
    );

    Config::from_value(json!({
        "job_monitor_poll_interval": 0.02,
        "job_command_timeout": 5.0,
        "hpc": {
            "submit_command": submit.to_string_lossy(),
            "status_command": status.to_string_lossy(),
        },
    }))
}

fn tenx_config(work_dir: &Path) -> Config {
    let template = work_dir.join("template.sh");
    std::fs::write(
        &template,
        "#!/bin/bash\n#SBATCH -J {job_name}\ncellranger count {sample_id} in {sample_dir}\n",
    )
    .unwrap();
    Config::from_value(json!({
        "tenx_dir": work_dir.to_string_lossy(),
        "job_template": template.to_string_lossy(),
    }))
}

fn ss3_config(work_dir: &Path) -> Config {
    let template = work_dir.join("template.sh");
    std::fs::write(
        &template,
        "#!/bin/bash\n#SBATCH -J {job_name}\nzumis {sample_id} {barcode} in {sample_dir}\n",
    )
    .unwrap();
    Config::from_value(json!({
        "smartseq3_dir": work_dir.to_string_lossy(),
        "job_template": template.to_string_lossy(),
        "required_fields": ["project_id", "project_name"],
    }))
}

fn tenx_doc(project_id: &str, sample_ids: &[&str], submit: bool) -> Value {
    let mut samples = serde_json::Map::new();
    for sample_id in sample_ids {
        samples.insert(
            sample_id.to_string(),
            json!({
                "details": {},
                "library_prep": {"A": {"sequenced_fc": ["240101_A00187_FCA"]}},
            }),
        );
    }
    json!({
        "_id": format!("doc-{project_id}"),
        "project_id": project_id,
        "project_name": format!("Name.of.{project_id}"),
        "details": {"library_construction_method": "10X Chromium GEX v3"},
        "pipeline_info": {"submit": submit},
        "samples": samples,
    })
}

fn manager() -> Arc<YggdrasilDbManager> {
    Arc::new(YggdrasilDbManager::new(Arc::new(MemoryBackend::new())))
}

// Happy auto-submit path: every sample submits, monitors to COMPLETED, and
// post-processes; the project closes with an end date.
#[tokio::test]
async fn auto_submit_path_completes_the_project() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "none")));

    let doc = tenx_doc("P1", &["P1_101", "P1_102"], true);
    let mut realm =
        TenXProject::with_config(doc, ydm.clone(), hpc, tenx_config(dir.path())).await;
    assert!(realm.proceed());
    realm.launch_template().await;

    let stored = ydm.get_document("P1").await.unwrap();
    assert_eq!(stored.project_status, ProjectStatus::Completed);
    assert!(!stored.end_date.is_empty());
    for sample_id in ["P1_101", "P1_102"] {
        let sample = stored.get_sample(sample_id).unwrap();
        assert_eq!(sample.status, SampleStatus::Completed);
        assert!(!sample.job_id.is_empty());
        assert!(!sample.start_time.is_empty());
        assert!(!sample.end_time.is_empty());
        assert_eq!(sample.flowcell_ids_processed_for, vec!["240101_A00187_FCA"]);
    }

    // One submission per sample, and both jobs were polled.
    let submits = std::fs::read_to_string(dir.path().join("submits.log")).unwrap();
    assert_eq!(submits.lines().count(), 2);
    let polls = std::fs::read_to_string(dir.path().join("polls.log")).unwrap();
    assert!(polls.lines().any(|line| line == "91101"));
    assert!(polls.lines().any(|line| line == "91102"));
}

// Manual-submit two-phase flow: the first pass parks the project, an
// external actor records job ids, and the second pass finishes it.
#[tokio::test]
async fn manual_submit_runs_in_two_phases() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "none")));
    let config = tenx_config(dir.path());

    let doc = tenx_doc("P2", &["P2_201", "P2_202"], false);
    let mut realm =
        TenXProject::with_config(doc.clone(), ydm.clone(), hpc.clone(), config.clone()).await;
    realm.launch_template().await;

    let parked = ydm.get_document("P2").await.unwrap();
    assert_eq!(
        parked.project_status,
        ProjectStatus::ManuallySubmittedSamples
    );
    for sample in &parked.samples {
        assert!(sample.job_id.is_empty());
    }

    // External actor submits the jobs and records them in the database.
    for (sample_id, job_id) in [("P2_201", "97001"), ("P2_202", "97002")] {
        ydm.update_sample_field("P2", sample_id, "job_id", &json!(job_id))
            .await
            .unwrap();
        ydm.update_sample_status("P2", sample_id, SampleStatus::ManuallySubmitted)
            .await
            .unwrap();
    }
    assert_eq!(
        ydm.get_document("P2").await.unwrap().project_status,
        ProjectStatus::ManuallySubmittedSamples
    );

    // Second event: re-enter at manually_submitted_samples.
    let mut realm = TenXProject::with_config(doc, ydm.clone(), hpc, config).await;
    assert!(realm.proceed());
    realm.launch_template().await;

    let finished = ydm.get_document("P2").await.unwrap();
    assert_eq!(finished.project_status, ProjectStatus::Completed);
    for sample in &finished.samples {
        assert_eq!(sample.status, SampleStatus::Completed);
    }

    // No submissions went through the scheduler in either phase.
    assert!(!dir.path().join("submits.log").exists());
    let polls = std::fs::read_to_string(dir.path().join("polls.log")).unwrap();
    assert!(polls.lines().any(|line| line == "97001"));
    assert!(polls.lines().any(|line| line == "97002"));
}

// One failing sample must not drag the others down, and the project ends
// partially completed without an end date.
#[tokio::test]
async fn one_failed_sample_leaves_the_project_partially_completed() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    // Sample P3_302's job id is 93302 under the stub's naming scheme.
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "93302")));

    let doc = tenx_doc("P3", &["P3_301", "P3_302", "P3_303"], true);
    let mut realm =
        TenXProject::with_config(doc, ydm.clone(), hpc, tenx_config(dir.path())).await;
    realm.launch_template().await;

    let stored = ydm.get_document("P3").await.unwrap();
    assert_eq!(
        stored.get_sample("P3_301").unwrap().status,
        SampleStatus::Completed
    );
    assert_eq!(
        stored.get_sample("P3_302").unwrap().status,
        SampleStatus::ProcessingFailed
    );
    assert_eq!(
        stored.get_sample("P3_303").unwrap().status,
        SampleStatus::Completed
    );
    assert!(!stored.get_sample("P3_302").unwrap().end_time.is_empty());
    assert_eq!(stored.project_status, ProjectStatus::PartiallyCompleted);
    assert!(stored.end_date.is_empty());
}

// Samples aborted upstream are never registered at all.
#[tokio::test]
async fn aborted_samples_are_never_registered() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "none")));

    let mut doc = tenx_doc("P4", &["P4_401", "P4_402"], true);
    doc["samples"]["P4_402"]["details"]["status_(manual)"] = json!("Aborted");

    let mut realm =
        TenXProject::with_config(doc, ydm.clone(), hpc, tenx_config(dir.path())).await;
    realm.launch_template().await;

    let stored = ydm.get_document("P4").await.unwrap();
    assert!(stored.get_sample("P4_401").is_some());
    assert!(stored.get_sample("P4_402").is_none());
    assert_eq!(stored.samples.len(), 1);
    assert_eq!(stored.project_status, ProjectStatus::Completed);
}

// A module the registry cannot place creates nothing: the handler refuses
// the unknown realm id and the database stays empty.
#[tokio::test]
async fn unknown_module_creates_no_document() {
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(MockJobManager::with_timings(Duration::from_millis(5), 0.01..0.02));
    let handler = ProjectChangeHandler::new(ydm.clone(), hpc);

    let payload = json!({
        "document": {
            "project_id": "P5",
            "details": {"library_construction_method": "Unheard Of Kit"},
        },
        "module_location": "unheard_of_module",
    });
    handler.handle_task(payload).await;

    assert!(!ydm.project_exists("P5").await);
}

// SmartSeq3 finishes through the QC gate instead of closing outright, and
// books the latest flowcell per sample.
#[tokio::test]
async fn smartseq3_finalizes_into_pending_qc() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "none")));

    let doc = json!({
        "_id": "doc-P6",
        "project_id": "P6",
        "project_name": "S.Svensson_25_02",
        "details": {"library_construction_method": "SmartSeq 3"},
        "samples": {
            "P6_601": {
                "details": {"total_reads_(m)": 0.5},
                "library_prep": {
                    "A": {
                        "barcode": "SS3-D7",
                        "sequenced_fc": ["240101_A00187_FCA", "240301_A00187_FCB"],
                    },
                },
            },
        },
    });

    let mut realm =
        SmartSeq3Project::with_config(doc, ydm.clone(), hpc, ss3_config(dir.path())).await;
    assert!(realm.proceed());
    realm.launch_template().await;

    let stored = ydm.get_document("P6").await.unwrap();
    assert_eq!(stored.project_status, ProjectStatus::PendingQc);
    let sample = stored.get_sample("P6_601").unwrap();
    assert_eq!(sample.status, SampleStatus::Completed);
    assert_eq!(
        sample.flowcell_ids_processed_for,
        vec!["240301_A00187_FCB"]
    );

    // The generated script went through the template.
    let script = std::fs::read_to_string(
        dir.path()
            .join("projects")
            .join("S.Svensson_25_02")
            .join("P6_601")
            .join("P6_601_job.sh"),
    )
    .unwrap();
    assert!(script.contains("#SBATCH -J P6_P6_601"));
    assert!(script.contains("zumis P6_601 D7"));
}

// A realm whose required fields are missing never proceeds and never touches
// the database.
#[tokio::test]
async fn missing_required_fields_gate_the_realm() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(MockJobManager::with_timings(Duration::from_millis(5), 0.01..0.02));

    // project_name is required by the config but absent from the doc.
    let doc = json!({
        "_id": "doc-P7",
        "project_id": "P7",
        "details": {"library_construction_method": "SmartSeq 3"},
        "samples": {},
    });
    let realm =
        SmartSeq3Project::with_config(doc, ydm.clone(), hpc, ss3_config(dir.path())).await;

    assert!(!realm.proceed());
    assert!(!ydm.project_exists("P7").await);
}

// Re-running the whole lifecycle on an already completed project is a no-op
// pass: the realm reports proceed=false.
#[tokio::test]
async fn completed_projects_are_not_reprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let ydm = manager();
    let hpc: Arc<dyn JobManager> =
        Arc::new(SlurmJobManager::from_config(&stub_scheduler(dir.path(), "none")));
    let config = tenx_config(dir.path());

    let doc = tenx_doc("P8", &["P8_801"], true);
    let mut realm =
        TenXProject::with_config(doc.clone(), ydm.clone(), hpc.clone(), config.clone()).await;
    realm.launch_template().await;
    assert_eq!(
        ydm.get_document("P8").await.unwrap().project_status,
        ProjectStatus::Completed
    );

    let realm = TenXProject::with_config(doc, ydm.clone(), hpc, config).await;
    assert!(!realm.proceed());
}
