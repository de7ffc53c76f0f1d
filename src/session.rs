use std::sync::OnceLock;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0} was already set; cannot change mid-run")]
pub struct AlreadyInitialized(&'static str);

static DEV_MODE: OnceLock<bool> = OnceLock::new();
static MANUAL_SUBMIT: OnceLock<bool> = OnceLock::new();

/// Process-wide flags set exactly once at startup. Readable from anywhere,
/// never mutated afterwards.
pub struct YggSession;

impl YggSession {
    pub fn init_dev_mode(dev: bool) -> Result<(), AlreadyInitialized> {
        DEV_MODE
            .set(dev)
            .map_err(|_| AlreadyInitialized("dev mode"))
    }

    pub fn is_dev() -> bool {
        DEV_MODE.get().copied().unwrap_or(false)
    }

    pub fn init_manual_submit(manual: bool) -> Result<(), AlreadyInitialized> {
        MANUAL_SUBMIT
            .set(manual)
            .map_err(|_| AlreadyInitialized("manual-submit flag"))
    }

    pub fn is_manual_submit() -> bool {
        MANUAL_SUBMIT.get().copied().unwrap_or(false)
    }
}
