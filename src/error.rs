use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation conflicted with a concurrent transaction and was rolled
    /// back; the caller may retry it.
    #[error("Operation conflicted with a concurrent transaction")]
    Rollback,
    /// An insert found an existing key when overwrite was not requested.
    #[error("Key already exists")]
    DuplicateKey,
    /// Sentinel for a missing key or record. Never logged.
    #[error("Item not found")]
    NotFound,
    /// The underlying resource is momentarily held by another thread.
    #[error("Resource busy")]
    Busy,
    /// The operation must be restarted from the caller's saved position.
    #[error("Restart the operation")]
    Restart,
    /// The database must be opened with recovery enabled.
    #[error("Recovery must be run to continue")]
    RunRecovery,
    /// The engine was poisoned by an earlier fatal error; every call fails
    /// with this code until the process restarts.
    #[error("The engine encountered a fatal error and is unusable")]
    Panic,
    /// An async operation was cancelled before a worker picked it up.
    #[error("Operation cancelled")]
    Cancelled,
    /// The engine is shutting down and accepts no new work.
    #[error("The engine is shutting down")]
    Shutdown,
    /// Checksum mismatch or structural invariant violation on disk.
    #[error("Corruption in {object} at offset 0x{offset:x}: {detail}")]
    Corruption {
        object: &'static str,
        offset: u64,
        detail: &'static str,
    },
    /// Couldn't open or lock the database home for exclusive use.
    #[error("Failed to lock the database home for exclusive use")]
    HomeLock(#[source] std::io::Error),
    /// An open-time configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Errors from the host filesystem, including ENOSPC and ENOMEM.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the transient class: the caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy | Error::Restart | Error::Rollback)
    }

    pub(crate) fn corrupt(object: &'static str, offset: u64, detail: &'static str) -> Error {
        Error::Corruption {
            object,
            offset,
            detail,
        }
    }
}

/// Poison flag shared by every handle of one engine. Once set, all public
/// calls fail fast with [`Error::Panic`].
#[derive(Debug, Default)]
pub struct PanicCell {
    poisoned: AtomicBool,
}

impl PanicCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poison the engine. Returns [`Error::Panic`] so callers can
    /// `return Err(cell.poison())`.
    pub fn poison(&self) -> Error {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            log::error!("engine poisoned; all future calls will fail");
        }
        Error::Panic
    }

    pub fn check(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Relaxed) {
            Err(Error::Panic)
        } else {
            Ok(())
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }
}
