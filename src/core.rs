use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use itertools::Itertools;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use yggdrasil_db::{ProjectDbManager, SeqTracker, YggdrasilDbManager};

use crate::config::Config;
use crate::events::{EventType, YggdrasilEvent};
use crate::handlers::{self, EventHandler, ProjectChangeHandler};
use crate::hpc::JobManager;
use crate::module_resolver::ModuleResolver;
use crate::watchers::{CouchDbWatcher, SeqDataWatcher, SeqDataWatcherConfig, Watcher};

const DEFAULT_COUCHDB_POLL_INTERVAL: f64 = 5.0;

/// Central orchestrator: owns the watchers, the per-kind handler map, and
/// the handles everything downstream works through. One instance per
/// process.
pub struct YggdrasilCore {
    config: Config,
    pdm: Arc<ProjectDbManager>,
    ydm: Arc<YggdrasilDbManager>,
    hpc: Arc<dyn JobManager>,
    resolver: Arc<ModuleResolver>,
    tracker: SeqTracker,
    watchers: Vec<Arc<dyn Watcher>>,
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl YggdrasilCore {
    pub fn new(
        config: Config,
        pdm: Arc<ProjectDbManager>,
        ydm: Arc<YggdrasilDbManager>,
        hpc: Arc<dyn JobManager>,
        resolver: Arc<ModuleResolver>,
        tracker: SeqTracker,
    ) -> Self {
        let core = Self {
            config,
            pdm,
            ydm,
            hpc,
            resolver,
            tracker,
            watchers: Vec::new(),
            handlers: HashMap::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        };
        info!("YggdrasilCore initialized.");
        core
    }

    /// Token shared with every watcher and monitor; cancelling it is what
    /// `stop` does.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register_watcher(&mut self, watcher: Arc<dyn Watcher>) {
        debug!("Registering watcher: {}", watcher.name());
        self.watchers.push(watcher);
    }

    /// One handler per event kind; re-registration overwrites.
    pub fn register_handler(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type, handler);
        debug!("Registered handler for event_type='{event_type}'");
    }

    /// External handlers declare their event kind as a string; a kind that
    /// does not parse into `EventType` is skipped with an error.
    pub fn register_external_handler(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) {
        match event_type.parse::<EventType>() {
            Ok(kind) => self.register_handler(kind, handler),
            Err(_) => {
                error!("External handler declares unknown event type '{event_type}'; skipped.")
            }
        }
    }

    pub fn setup_handlers(&mut self) {
        let project_handler = Arc::new(ProjectChangeHandler::new(
            self.ydm.clone(),
            self.hpc.clone(),
        ));
        self.register_handler(EventType::ProjectChange, project_handler);

        info!(
            "Registered handlers: {}",
            self.handlers.keys().map(|kind| kind.to_string()).join(", ")
        );
    }

    pub fn setup_watchers(&mut self) {
        info!("Setting up watchers...");
        self.setup_fs_watchers();
        self.setup_cdb_watchers();
        info!("Watchers setup done.");
    }

    fn setup_fs_watchers(&mut self) {
        let instruments = self
            .config
            .array_at("instrument_watch")
            .cloned()
            .unwrap_or_default();
        for instrument in instruments {
            let name = instrument
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("UnnamedInstrument")
                .to_string();
            let directory = instrument
                .get("directory")
                .and_then(Value::as_str)
                .unwrap_or("/tmp")
                .to_string();
            let marker_files: HashSet<String> = instrument
                .get("marker_files")
                .and_then(Value::as_array)
                .map(|markers| {
                    markers
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            let watcher = SeqDataWatcher::new(SeqDataWatcherConfig {
                instrument_name: name.clone(),
                directory: PathBuf::from(directory),
                marker_files,
            });
            self.register_watcher(Arc::new(watcher));
            debug!("Registered SeqDataWatcher for {name}");
        }
    }

    fn setup_cdb_watchers(&mut self) {
        info!("Setting up CouchDB watchers...");
        let poll_interval = self
            .config
            .f64_at("couchdb_poll_interval")
            .unwrap_or(DEFAULT_COUCHDB_POLL_INTERVAL);

        let watcher = CouchDbWatcher::new(
            "ProjectDBWatcher",
            self.pdm.clone(),
            self.resolver.clone(),
            self.tracker.clone(),
            Duration::from_secs_f64(poll_interval),
        );
        self.register_watcher(Arc::new(watcher));
        debug!("Registered CouchDBWatcher for the projects database.");
    }

    /// Run every watcher plus the dispatch loop until `stop` is called (or
    /// every watcher exits on its own). Calling `start` while already
    /// running logs and returns.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("YggdrasilCore is already running.");
            return;
        }

        info!("Starting all watchers...");
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

        let tasks: Vec<_> = self
            .watchers
            .iter()
            .map(|watcher| {
                let watcher = watcher.clone();
                let sender = sender.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move { watcher.run(sender, cancel).await })
            })
            .collect();
        drop(sender);
        info!("Running {} watchers in parallel.", tasks.len());

        // The dispatch loop ends when the last watcher drops its sender.
        while let Some(event) = receiver.recv().await {
            self.handle_event(event);
        }

        for result in join_all(tasks).await {
            if let Err(err) = result {
                error!("Watcher task failed: {err}");
            }
        }
        info!("All watchers have exited or been stopped.");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signal every watcher to wind down. `start` returns once they have all
    /// quiesced. Safe to call when not running.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("YggdrasilCore stop called, but not running.");
            return;
        }
        info!("Stopping all watchers...");
        self.cancel.cancel();
    }

    /// The callback watchers feed; looks up the handler for the event kind
    /// and fire-and-forgets its task onto the runtime.
    pub fn handle_event(&self, event: YggdrasilEvent) {
        info!(
            "Received event '{}' from '{}'",
            event.event_type, event.source
        );
        match self.handlers.get(&event.event_type) {
            Some(handler) => {
                debug!(
                    "Dispatching event_type='{}' to its handler.",
                    event.event_type
                );
                handlers::dispatch(handler.clone(), event.payload);
            }
            None => {
                warn!(
                    "No handler registered for event_type='{}'",
                    event.event_type
                );
            }
        }
    }

    #[cfg(test)]
    fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// One-off mode: fetch the project document, resolve its realm, and run
    /// the project-change handler to completion without starting watchers.
    pub async fn run_once(&self, doc_id: &str) {
        let Some(document) = self.pdm.fetch_document_by_id(doc_id).await else {
            error!("No project with ID {doc_id}");
            return;
        };

        let Some(module_location) = self.resolver.resolve(&document) else {
            error!("No module for project {doc_id}");
            return;
        };

        let payload = json!({
            "document": document,
            "module_location": module_location,
        });

        let Some(handler) = self.handlers.get(&EventType::ProjectChange) else {
            error!("No handler for 'project_change'");
            return;
        };
        handler.run_now(payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpc::MockJobManager;
    use async_trait::async_trait;
    use yggdrasil_db::MemoryBackend;

    struct NullHandler;

    #[async_trait]
    impl EventHandler for NullHandler {
        async fn handle_task(&self, _payload: Value) {}
    }

    fn test_core() -> YggdrasilCore {
        // The Couch handle performs no I/O until used, so a placeholder URL
        // is fine for registry tests.
        let couch = couch::Couch::new("http://localhost:5984", None, None);
        let ydm = Arc::new(YggdrasilDbManager::new(Arc::new(MemoryBackend::new())));
        YggdrasilCore::new(
            Config::empty(),
            Arc::new(ProjectDbManager::new(couch, "projects")),
            ydm,
            Arc::new(MockJobManager::new()),
            Arc::new(crate::module_resolver::ModuleResolver::new(Config::empty())),
            SeqTracker::new("/tmp/.last_processed_seq"),
        )
    }

    #[test]
    fn external_handlers_with_unknown_kinds_are_skipped() {
        let mut core = test_core();
        core.setup_handlers();
        assert_eq!(core.handler_count(), 1);

        core.register_external_handler("surprise_event", Arc::new(NullHandler));
        assert_eq!(core.handler_count(), 1);

        core.register_external_handler("flowcell_ready", Arc::new(NullHandler));
        assert_eq!(core.handler_count(), 2);

        // Re-registration overwrites instead of accumulating.
        core.register_external_handler("flowcell_ready", Arc::new(NullHandler));
        assert_eq!(core.handler_count(), 2);
    }
}
