pub mod couch_feed;
pub mod seq_data;

pub use couch_feed::CouchDbWatcher;
pub use seq_data::{SeqDataWatcher, SeqDataWatcherConfig};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::events::YggdrasilEvent;

pub type EventSender = UnboundedSender<YggdrasilEvent>;

/// A watcher monitors one external system (filesystem, database) and feeds
/// events into the core. `run` loops until the token is cancelled and
/// returns only once the watcher has quiesced; watchers share no state with
/// each other.
#[async_trait]
pub trait Watcher: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, events: EventSender, cancel: CancellationToken);
}
