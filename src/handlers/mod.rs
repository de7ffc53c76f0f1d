pub mod project_change;

pub use project_change::ProjectChangeHandler;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Per-event-kind strategy. `handle_task` does the real work; `run_now` is
/// the blocking entry point one-off CLI runs use; `dispatch` is the
/// fire-and-forget path the core uses for watcher events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_task(&self, payload: Value);

    async fn run_now(&self, payload: Value) {
        self.handle_task(payload).await;
    }
}

/// Schedule `handle_task` onto the runtime without blocking the caller.
pub fn dispatch(handler: Arc<dyn EventHandler>, payload: Value) {
    tokio::spawn(async move {
        handler.handle_task(payload).await;
    });
}
