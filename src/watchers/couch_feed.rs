use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use log::info;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use yggdrasil_db::{ProjectDbManager, SeqTracker};

use crate::events::{EventType, YggdrasilEvent};
use crate::module_resolver::ModuleResolver;
use crate::watchers::{EventSender, Watcher};

/// Tails the projects database. Each changed document is resolved to a realm
/// module; documents no module claims are suppressed. When a feed pass ends
/// (server closed it, or it errored out) the watcher sleeps `poll_interval`
/// and re-enters from the persisted cursor.
pub struct CouchDbWatcher {
    name: String,
    pdm: Arc<ProjectDbManager>,
    resolver: Arc<ModuleResolver>,
    tracker: SeqTracker,
    poll_interval: Duration,
}

impl CouchDbWatcher {
    pub fn new(
        name: impl Into<String>,
        pdm: Arc<ProjectDbManager>,
        resolver: Arc<ModuleResolver>,
        tracker: SeqTracker,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            pdm,
            resolver,
            tracker,
            poll_interval,
        }
    }
}

#[async_trait]
impl Watcher for CouchDbWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, events: EventSender, cancel: CancellationToken) {
        info!("Starting CouchDB watcher: {}", self.name);

        loop {
            let stream = self.pdm.changes(self.tracker.clone());
            pin_mut!(stream);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("CouchDB watcher '{}' stopped.", self.name);
                        return;
                    }
                    item = stream.next() => {
                        match item {
                            Some((document, _seq)) => {
                                // Most feed documents are not Yggdrasil's
                                // business; only resolvable ones become events.
                                if let Some(module_location) = self.resolver.resolve(&document) {
                                    let payload = json!({
                                        "document": document,
                                        "module_location": module_location,
                                    });
                                    let _ = events.send(YggdrasilEvent::new(
                                        EventType::ProjectChange,
                                        payload,
                                        "couchdb",
                                    ));
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("CouchDB watcher '{}' stopped.", self.name);
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
