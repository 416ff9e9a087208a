//! Rotation-aware byte accounting
//!
//! Converts file sizes observed after events into monotonic per-container
//! byte counters. Two rotation schemes are handled without knowing which
//! one is in effect:
//! - copy-truncate: the file shrinks in place, the whole new size is credited
//! - rename/symlink: a new path (or a new file behind the same path) appears
//!   and is credited from zero

use super::labels::{is_pod_dir, LogLabels};
use crate::observability::LogWatchMetrics;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Tracks the last observed size of every log file and credits growth
pub struct ByteAccountant {
    /// log path -> last observed size in bytes
    sizes: HashMap<PathBuf, u64>,
    metrics: LogWatchMetrics,
    max_depth: usize,
}

impl ByteAccountant {
    pub fn new(metrics: LogWatchMetrics, max_depth: usize) -> Self {
        Self {
            sizes: HashMap::new(),
            metrics,
            max_depth,
        }
    }

    /// Credit every log file already present under `root`
    pub fn seed_from_walk(&mut self, root: &Path) {
        let mut stack = vec![(root.to_path_buf(), 0usize)];

        while let Some((path, depth)) = stack.pop() {
            if LogLabels::parse(&path).is_some() {
                self.update_file(&path);
                continue;
            }
            if depth >= self.max_depth {
                continue;
            }
            // Not a directory, or gone already
            let Ok(entries) = fs::read_dir(&path) else {
                continue;
            };
            for entry in entries.flatten() {
                let is_dir = entry.file_type().is_ok_and(|ft| ft.is_dir());
                let child = entry.path();
                if is_dir || LogLabels::parse(&child).is_some() {
                    stack.push((child, depth + 1));
                }
            }
        }

        self.metrics.set_tracked_files(self.sizes.len());
        debug!(root = %root.display(), files = self.sizes.len(), "Seeded log sizes");
    }

    /// Credit growth of `path`.
    ///
    /// Paths that are not container log files are treated as directories and
    /// their entries are updated, since a directory may be reported before
    /// the files created inside it.
    pub fn update(&mut self, path: &Path) {
        let mut stack = vec![(path.to_path_buf(), 0usize)];

        while let Some((path, depth)) = stack.pop() {
            if LogLabels::parse(&path).is_some() {
                self.update_file(&path);
                continue;
            }
            if depth >= self.max_depth {
                continue;
            }
            if let Ok(entries) = fs::read_dir(&path) {
                stack.extend(entries.flatten().map(|e| (e.path(), depth + 1)));
            }
        }

        self.metrics.set_tracked_files(self.sizes.len());
    }

    fn update_file(&mut self, path: &Path) {
        let Some(labels) = LogLabels::parse(path) else {
            return;
        };

        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            // Removed after the event was queued
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat log file");
                self.metrics.inc_update_errors();
                return;
            }
        };

        let last_size = self.sizes.insert(path.to_path_buf(), size).unwrap_or(0);
        let add = credit(last_size, size);
        self.metrics.add_logged_bytes(&labels, add);

        debug!(
            path = %path.display(),
            size = size,
            last_size = last_size,
            added = add,
            "Updated logged bytes"
        );
    }

    /// Forget a removed pod log directory.
    ///
    /// Every size recorded under the directory is dropped together with the
    /// series it fed. Removal of anything other than a pod directory is
    /// ignored, so a log file that is deleted and recreated keeps adding to
    /// the same series. Returns the number of forgotten files.
    pub fn remove(&mut self, path: &Path) -> usize {
        if !is_pod_dir(path) {
            return 0;
        }

        let gone: Vec<PathBuf> = self
            .sizes
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .collect();

        for key in &gone {
            self.sizes.remove(key);
            if let Some(labels) = LogLabels::parse(key) {
                self.metrics.remove_logged_bytes(&labels);
            }
        }

        self.metrics.set_tracked_files(self.sizes.len());
        gone.len()
    }

    /// Last observed size of `path`, if it has been seen
    pub fn size(&self, path: &Path) -> Option<u64> {
        self.sizes.get(path).copied()
    }

    pub fn tracked_files(&self) -> usize {
        self.sizes.len()
    }
}

/// Bytes to credit when a file of `last_size` is now `size` bytes long.
///
/// A shrunken file was truncated in place and everything in it is new.
/// Bytes written between the truncation and this observation that were
/// already counted are counted again; that overcount is accepted.
pub(crate) fn credit(last_size: u64, size: u64) -> u64 {
    if size >= last_size {
        size - last_size
    } else {
        size
    }
}
