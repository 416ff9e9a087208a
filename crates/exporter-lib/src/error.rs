//! Error types for the log watcher
//!
//! Transient stat failures are deliberately not represented here: a path
//! vanishing between an event and the following stat is an expected race
//! and is skipped where it happens.

use std::path::PathBuf;

/// Errors surfaced by [`crate::symnotify::SymlinkWatcher`] and
/// [`crate::logwatch::LogWatcher`]
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The platform notification facility could not be opened
    #[error("failed to initialize filesystem notifications: {0}")]
    Init(#[source] notify::Error),

    /// A watch could not be registered for a path
    #[error("failed to watch `{path}`: {source}")]
    Registration {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The watcher was closed and every buffered event has been delivered
    #[error("event stream closed")]
    EndOfStream,

    /// The notification backend reported a fault
    #[error("event stream fault: {0}")]
    Stream(#[source] notify::Error),

    /// The byte counter could not be registered with the metrics registry
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl WatchError {
    /// Returns true for the clean end-of-stream condition that follows a close
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, WatchError::EndOfStream)
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
