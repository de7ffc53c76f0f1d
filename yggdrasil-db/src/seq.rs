use std::path::PathBuf;

use log::warn;

/// Persistence of the change-feed cursor: a single opaque token in a small
/// file, rewritten on every advance. This (plus the yggdrasil database) is
/// the only durable state the engine keeps.
#[derive(Debug, Clone)]
pub struct SeqTracker {
    path: PathBuf,
}

// Zero means "start from the beginning of the feed".
const DEFAULT_SEQ: &str = "0";

impl SeqTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> String {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let seq = contents.trim();
                if seq.is_empty() {
                    DEFAULT_SEQ.to_string()
                } else {
                    seq.to_string()
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => DEFAULT_SEQ.to_string(),
            Err(err) => {
                warn!(
                    "Could not read cursor file '{}': {err}. Starting from the beginning.",
                    self.path.display()
                );
                DEFAULT_SEQ.to_string()
            }
        }
    }

    /// Write-temp-then-rename so a crash mid-write can never leave a torn
    /// cursor behind.
    pub async fn save(&self, seq: &str) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, seq).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}
