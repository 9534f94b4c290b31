use casbin_watcher::WatcherError;
use thiserror::Error;

/// Errors that can occur when using the in-memory watcher.
#[derive(Debug, Error)]
pub enum Error {
    /// The watcher has been closed; no further notifications can be
    /// published through it.
    #[error("watcher is closed")]
    Closed,
}

impl WatcherError for Error {}
