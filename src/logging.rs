use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Local;
use env_logger::{Builder, Env, Target};

/// Set up process-wide logging: one log file per run in `log_dir`, default
/// level `info` (`debug` in dev mode), still overridable through `RUST_LOG`.
/// Failing to open the log directory is one of the few startup errors that
/// aborts the process.
pub fn configure_logging(dev: bool, log_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_path = log_dir.join(format!("yggdrasil_{timestamp}.log"));
    let log_file = File::create(&log_path)?;

    let default_level = if dev { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_level))
        .target(Target::Pipe(Box::new(log_file)))
        .init();

    Ok(log_path)
}
