use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, info};
use notify::{EventKind, RecursiveMode, Watcher as _};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::events::{EventType, YggdrasilEvent};
use crate::watchers::{EventSender, Watcher};

#[derive(Debug, Clone)]
pub struct SeqDataWatcherConfig {
    pub instrument_name: String,
    pub directory: PathBuf,
    pub marker_files: HashSet<String>,
}

/// Watches one instrument's output directory for completed runs. A run
/// folder is ready when every configured marker file has appeared in it;
/// each folder fires exactly one `FlowcellReady` event and is then forgotten,
/// so re-emission requires a fresh discovery.
pub struct SeqDataWatcher {
    name: String,
    config: SeqDataWatcherConfig,
}

impl SeqDataWatcher {
    pub fn new(config: SeqDataWatcherConfig) -> Self {
        Self {
            name: format!("SeqDataWatcher-{}", config.instrument_name),
            config,
        }
    }

    fn note_created(
        &self,
        path: &Path,
        discovered: &mut HashMap<PathBuf, HashSet<String>>,
        events: &EventSender,
    ) {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return;
        };
        if !self.config.marker_files.contains(file_name) {
            return;
        }
        let Some(subfolder) = path.parent() else {
            return;
        };
        debug!(
            "[{}] New file {file_name} in {}",
            self.config.instrument_name,
            subfolder.display()
        );

        let markers = discovered.entry(subfolder.to_path_buf()).or_default();
        markers.insert(file_name.to_string());

        // Only marker names ever enter the set, so size equality means the
        // full marker set is present.
        if markers.len() == self.config.marker_files.len() {
            info!(
                "{}: Found all markers in {}",
                self.config.instrument_name,
                subfolder.display()
            );
            let payload = json!({
                "instrument": self.config.instrument_name,
                "subfolder": subfolder.to_string_lossy(),
            });
            let _ = events.send(YggdrasilEvent::new(
                EventType::FlowcellReady,
                payload,
                "filesystem",
            ));
            discovered.remove(subfolder);
        }
    }
}

#[async_trait]
impl Watcher for SeqDataWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, events: EventSender, cancel: CancellationToken) {
        info!(
            "Starting filesystem watcher for {}",
            self.config.instrument_name
        );

        // The OS watch API runs on its own thread; an unbounded channel
        // marshals its notifications into this task.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();
        let instrument = self.config.instrument_name.clone();
        let mut fs_watcher =
            match notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(err) => error!("[{instrument}] Filesystem watch error: {err}"),
                }
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!(
                        "[{}] Could not create the filesystem watcher: {err}",
                        self.config.instrument_name
                    );
                    return;
                }
            };

        if let Err(err) = fs_watcher.watch(&self.config.directory, RecursiveMode::Recursive) {
            error!(
                "[{}] Could not watch '{}': {err}",
                self.config.instrument_name,
                self.config.directory.display()
            );
            return;
        }

        let mut discovered: HashMap<PathBuf, HashSet<String>> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !matches!(event.kind, EventKind::Create(_)) {
                                continue;
                            }
                            for path in &event.paths {
                                self.note_created(path, &mut discovered, &events);
                            }
                        }
                        // The notify thread is gone; nothing more will come.
                        None => break,
                    }
                }
            }
        }

        drop(fs_watcher);
        info!(
            "Filesystem watcher '{}' stopped.",
            self.config.instrument_name
        );
    }
}
