use std::collections::HashSet;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use yggdrasil::events::EventType;
use yggdrasil::watchers::{SeqDataWatcher, SeqDataWatcherConfig, Watcher};

// Marker fan-in: one event once all markers are present in a subfolder, no
// re-fire when a marker reappears afterwards.
#[tokio::test]
async fn all_markers_in_a_subfolder_fire_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = SeqDataWatcher::new(SeqDataWatcherConfig {
        instrument_name: "Illumina".to_string(),
        directory: dir.path().to_path_buf(),
        marker_files: HashSet::from([
            "RTAComplete.txt".to_string(),
            "CopyComplete.txt".to_string(),
        ]),
    });

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(sender, cancel).await })
    };

    // Give the OS watch a moment to attach before producing files.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let run_dir = dir.path().join("240401_A00187_0123_AHXYZW");
    std::fs::create_dir(&run_dir).unwrap();
    std::fs::write(run_dir.join("RTAComplete.txt"), "").unwrap();

    // One marker is not enough.
    assert!(
        timeout(Duration::from_millis(400), receiver.recv())
            .await
            .is_err()
    );

    std::fs::write(run_dir.join("CopyComplete.txt"), "").unwrap();

    let event = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("an event should fire once all markers are present")
        .expect("channel should be open");
    assert_eq!(event.event_type, EventType::FlowcellReady);
    assert_eq!(event.source, "filesystem");
    assert_eq!(event.payload["instrument"], "Illumina");
    assert_eq!(
        event.payload["subfolder"],
        run_dir.to_string_lossy().as_ref()
    );

    // Re-creating a marker in the same folder must not re-fire.
    std::fs::remove_file(run_dir.join("RTAComplete.txt")).unwrap();
    std::fs::write(run_dir.join("RTAComplete.txt"), "").unwrap();
    assert!(
        timeout(Duration::from_millis(500), receiver.recv())
            .await
            .is_err()
    );

    cancel.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("watcher should quiesce after cancellation")
        .unwrap();
}

// Two subfolders discover independently.
#[tokio::test]
async fn subfolders_fire_independently() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = SeqDataWatcher::new(SeqDataWatcherConfig {
        instrument_name: "Aviti".to_string(),
        directory: dir.path().to_path_buf(),
        marker_files: HashSet::from(["RunUploaded.json".to_string()]),
    });

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(sender, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let run_a = dir.path().join("run_a");
    let run_b = dir.path().join("run_b");
    std::fs::create_dir(&run_a).unwrap();
    std::fs::create_dir(&run_b).unwrap();
    std::fs::write(run_a.join("RunUploaded.json"), "{}").unwrap();
    std::fs::write(run_b.join("RunUploaded.json"), "{}").unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("both subfolders should fire")
            .expect("channel should be open");
        seen.push(event.payload["subfolder"].as_str().unwrap().to_string());
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            run_a.to_string_lossy().to_string(),
            run_b.to_string_lossy().to_string(),
        ]
    );

    // Unrelated files are ignored.
    std::fs::write(run_a.join("notes.txt"), "ignore me").unwrap();
    assert!(
        timeout(Duration::from_millis(400), receiver.recv())
            .await
            .is_err()
    );

    cancel.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("watcher should quiesce after cancellation")
        .unwrap();
}
