//! Pod log watching
//!
//! Watches a kubelet pod log directory and maintains the
//! `log_logged_bytes_total` counter for every container found in it. The
//! counter survives copy-truncate and rename/symlink rotation as well as
//! restarts of the watched container.

mod accountant;
mod labels;

#[cfg(all(test, target_os = "linux"))]
mod tests;

pub use accountant::ByteAccountant;
pub use labels::{is_pod_dir, LogLabels, LABEL_NAMES};

use crate::error::{Result, WatchError};
use crate::observability::{LogWatchMetrics, StructuredLogger};
use crate::symnotify::{self, CloseHandle, Op, SymlinkWatcher};
use prometheus::Registry;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration for a [`LogWatcher`]
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root of the pod log tree (default: /var/log/pods)
    pub dir: PathBuf,
    /// Maximum directory nesting followed when registering and walking
    pub max_depth: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/pods"),
            max_depth: symnotify::DEFAULT_MAX_DEPTH,
        }
    }
}

impl WatchConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Watches pod log files and updates the logged bytes metric
pub struct LogWatcher {
    watcher: SymlinkWatcher,
    accountant: ByteAccountant,
    handle: LogWatcherHandle,
}

impl LogWatcher {
    /// Start watching `config.dir`.
    ///
    /// Metrics are registered with `registry` before the watch is added, and
    /// files already present are credited before this returns.
    pub fn new(config: &WatchConfig, registry: Registry, logger: StructuredLogger) -> Result<Self> {
        let mut watcher = SymlinkWatcher::new()?.with_max_depth(config.max_depth);
        let metrics = LogWatchMetrics::new()?;
        metrics.register(&registry)?;

        let handle = LogWatcherHandle {
            close: watcher.close_handle(),
            registry,
            metrics: metrics.clone(),
            logger,
        };

        if let Err(e) = watcher.add(&config.dir) {
            handle.close();
            return Err(e);
        }

        let mut accountant = ByteAccountant::new(metrics, config.max_depth);
        accountant.seed_from_walk(&config.dir);
        info!(
            dir = %config.dir.display(),
            files = accountant.tracked_files(),
            "Watching pod logs"
        );

        Ok(Self {
            watcher,
            accountant,
            handle,
        })
    }

    /// Get a handle for reading metrics and closing the watcher from
    /// another task
    pub fn handle(&self) -> LogWatcherHandle {
        self.handle.clone()
    }

    /// Consume events until the watcher is closed.
    ///
    /// Returns `Ok(())` after a close and any other watcher error as fatal.
    pub async fn watch(&mut self) -> Result<()> {
        loop {
            let event = match self.watcher.event().await {
                Ok(event) => event,
                Err(WatchError::EndOfStream) => {
                    info!("Log watcher stopped");
                    return Ok(());
                }
                Err(e) => {
                    self.handle.logger.log_watcher_failed(&e.to_string());
                    return Err(e);
                }
            };

            debug!(path = %event.name.display(), op = %event.op, "Log event");
            self.handle.metrics.inc_event(event.op);

            match event.op {
                Op::Remove => self.remove(&event.name),
                Op::Create | Op::Write | Op::Rename | Op::Chmod => {
                    self.accountant.update(&event.name)
                }
            }
        }
    }

    fn remove(&mut self, path: &Path) {
        let files = self.accountant.remove(path);
        if files > 0 {
            self.handle
                .logger
                .log_pod_removed(&path.display().to_string(), files);
        }
    }

    /// Close the watcher and unregister its metrics
    pub fn close(&self) {
        self.handle.close();
    }
}

/// Shared handle to a running [`LogWatcher`]
#[derive(Clone)]
pub struct LogWatcherHandle {
    close: CloseHandle,
    registry: Registry,
    metrics: LogWatchMetrics,
    logger: StructuredLogger,
}

impl LogWatcherHandle {
    /// Stop the watcher and unregister its metrics.
    ///
    /// A running [`LogWatcher::watch`] returns `Ok(())` once the events
    /// already received have been processed.
    pub fn close(&self) {
        self.close.close();
        self.metrics.unregister(&self.registry);
    }

    /// Bytes logged by the container identified by `labels`, or `None` if
    /// there is no series for it
    pub fn logged_bytes(&self, labels: &LogLabels) -> Option<u64> {
        self.metrics.logged_bytes(labels)
    }

    /// Bytes logged by the container owning the log file `path`
    pub fn logged_bytes_for(&self, path: &Path) -> Option<u64> {
        LogLabels::parse(path).and_then(|labels| self.logged_bytes(&labels))
    }

    pub fn metrics(&self) -> &LogWatchMetrics {
        &self.metrics
    }
}
