//! Symlink-transparent filesystem watcher
//!
//! Wraps the platform notification facility and presents a single event
//! stream for a directory tree:
//! - new subdirectories are registered as soon as their creation is seen
//! - symlinks to files are followed, and events for the target are reported
//!   under the link path
//! - replacing a link target in place is reported as [`Op::Chmod`] on the link
//!
//! Watches are non-recursive at the backend level; recursion is done here so
//! that every directory in the tree is known by its externally visible path.

mod event;


pub use event::{Event, Op};

use crate::error::{Result, WatchError};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default limit on directory nesting followed during registration
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Message from the notification backend thread
enum Raw {
    Notify(notify::Result<notify::Event>),
    Closed,
}

/// State shared between the watcher and its close handles
struct Shared {
    watcher: Mutex<Option<RecommendedWatcher>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Raw>>>,
}

impl Shared {
    fn close(&self) {
        // Dropping the backend watcher stops the notification thread
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watcher);

        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(Raw::Closed);
        }
    }
}

/// Closes a [`SymlinkWatcher`] from any thread.
///
/// A pending [`SymlinkWatcher::event`] call resolves to
/// [`WatchError::EndOfStream`] once the events buffered before the close have
/// been delivered.
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<Shared>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Watches a tree of files, directories and symlinks
pub struct SymlinkWatcher {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Raw>,
    /// Translated events not yet returned
    pending: VecDeque<Event>,
    /// Directories and files watched under their own (visible) path
    watched: HashSet<PathBuf>,
    /// link path -> resolved target
    links: HashMap<PathBuf, PathBuf>,
    /// resolved target -> every link resolving to it
    targets: HashMap<PathBuf, BTreeSet<PathBuf>>,
    /// Directories forgotten after being renamed, until their own watch reports the move
    moved_dirs: HashSet<PathBuf>,
    /// Directories watched to observe link targets, with the number of targets in each
    target_dirs: HashMap<PathBuf, usize>,
    max_depth: usize,
    closed: bool,
}

impl SymlinkWatcher {
    /// Open the notification facility
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_tx = tx.clone();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = event_tx.send(Raw::Notify(res));
            },
            notify::Config::default(),
        )
        .map_err(WatchError::Init)?;

        Ok(Self {
            shared: Arc::new(Shared {
                watcher: Mutex::new(Some(watcher)),
                tx: Mutex::new(Some(tx)),
            }),
            rx,
            pending: VecDeque::new(),
            watched: HashSet::new(),
            links: HashMap::new(),
            targets: HashMap::new(),
            moved_dirs: HashSet::new(),
            target_dirs: HashMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            closed: false,
        })
    }

    /// Set the directory nesting limit followed during registration
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Get a handle that can close this watcher from another task or thread
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: self.shared.clone(),
        }
    }

    /// Release the notification handle.
    ///
    /// Buffered events are still returned by [`Self::event`] before it reports
    /// [`WatchError::EndOfStream`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// Start watching `path`.
    ///
    /// Directories are registered together with every existing subdirectory.
    /// A symlink to a file is registered through its resolved target, and
    /// events for that target are reported under the link path.
    pub fn add(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let meta = fs::symlink_metadata(path).map_err(|e| registration_error(path, e))?;

        if meta.file_type().is_symlink() {
            if path.is_dir() {
                // The backend follows the link, so events keep the link path
                return self.add_dir(path);
            }
            return self.add_link(path);
        }

        if meta.is_dir() {
            self.add_dir(path)
        } else {
            self.watch_path(path)?;
            self.watched.insert(path.to_path_buf());
            Ok(())
        }
    }

    /// Wait for the next normalized event
    pub async fn event(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if self.closed {
                return Err(WatchError::EndOfStream);
            }

            match self.rx.recv().await {
                Some(Raw::Notify(Ok(event))) => self.translate(event),
                Some(Raw::Notify(Err(e))) => return Err(WatchError::Stream(e)),
                Some(Raw::Closed) | None => {
                    debug!("Watcher closed");
                    self.closed = true;
                }
            }
        }
    }

    /// Register `root` and every directory below it
    fn add_dir(&mut self, root: &Path) -> Result<()> {
        let mut stack = vec![(root.to_path_buf(), 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            match self.watch_path(&dir) {
                Ok(()) => {}
                // Subdirectories may disappear while the tree is walked
                Err(WatchError::Registration { ref source, .. })
                    if depth > 0 && is_vanished(source) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.watched.insert(dir.clone());

            if depth >= self.max_depth {
                warn!(path = %dir.display(), max_depth = self.max_depth, "Directory too deep, not descending");
                continue;
            }

            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(registration_error(&dir, e)),
            };

            for entry in entries.flatten() {
                let path = entry.path();
                match entry.file_type() {
                    Ok(ft) if ft.is_dir() => stack.push((path, depth + 1)),
                    Ok(ft) if ft.is_symlink() => {
                        if let Err(e) = self.add_link(&path) {
                            debug!(path = %path.display(), error = %e, "Skipping unresolvable symlink");
                        }
                    }
                    _ => {}
                }
            }
        }

        debug!(path = %root.display(), watched = self.watched.len(), "Registered directory tree");
        Ok(())
    }

    /// Follow a symlink to a file. Directory symlinks are not followed.
    fn add_link(&mut self, link: &Path) -> Result<()> {
        let target = fs::canonicalize(link).map_err(|e| registration_error(link, e))?;
        if target.is_dir() {
            return Ok(());
        }
        if self.links.get(link) == Some(&target) {
            return Ok(());
        }
        self.track_target(link, target)
    }

    fn track_target(&mut self, link: &Path, target: PathBuf) -> Result<()> {
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        // Watch the new directory before releasing the old one so no event is lost
        let count = self.target_dirs.get(&dir).copied().unwrap_or(0);
        if count == 0 && !self.watched.contains(&dir) {
            self.watch_path(&dir)?;
        }
        self.target_dirs.insert(dir, count + 1);

        self.forget_link(link);
        debug!(link = %link.display(), target = %target.display(), "Following symlink");
        self.links.insert(link.to_path_buf(), target.clone());
        self.targets
            .entry(target)
            .or_default()
            .insert(link.to_path_buf());
        Ok(())
    }

    fn forget_link(&mut self, link: &Path) {
        let Some(target) = self.links.remove(link) else {
            return;
        };
        if let Some(links) = self.targets.get_mut(&target) {
            links.remove(link);
            if links.is_empty() {
                self.targets.remove(&target);
            }
        }

        let Some(dir) = target.parent() else {
            return;
        };
        if let Some(count) = self.target_dirs.get_mut(dir) {
            *count -= 1;
            if *count == 0 {
                self.target_dirs.remove(dir);
                if !self.watched.contains(dir) {
                    self.unwatch_path(dir);
                }
            }
        }
    }

    /// Drop all state for `path` and anything below it
    fn forget_subtree(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in gone {
            self.watched.remove(&p);
            if !self.target_dirs.contains_key(&p) {
                self.unwatch_path(&p);
            }
        }

        let links: Vec<PathBuf> = self
            .links
            .keys()
            .filter(|l| l.starts_with(path))
            .cloned()
            .collect();
        for link in links {
            self.forget_link(&link);
        }
    }

    /// Translate one backend event into zero or more normalized events
    fn translate(&mut self, event: notify::Event) {
        for path in event.paths {
            let Some(op) = Op::from_kind(&event.kind, &path) else {
                continue;
            };

            if self.targets.contains_key(&path) {
                self.dispatch_target(&path, op);
            }
            if self.is_visible(&path) {
                self.dispatch_visible(path, op);
            }
        }
    }

    /// Handle an event on the resolved target of a followed symlink
    fn dispatch_target(&mut self, target: &Path, op: Op) {
        let Some(links) = self.targets.get(target).cloned() else {
            return;
        };

        for link in links {
            match op {
                Op::Write | Op::Chmod => self.pending.push_back(Event::new(link, op)),
                // A new file took the target's place
                Op::Create => {
                    if self.relink(&link) {
                        self.pending.push_back(Event::new(link, Op::Chmod));
                    }
                }
                // The link still exists; wait for a replacement target
                Op::Remove | Op::Rename => {
                    debug!(link = %link.display(), target = %target.display(), "Symlink target went away");
                }
            }
        }
    }

    /// Handle an event on a path inside the watched tree
    fn dispatch_visible(&mut self, path: PathBuf, op: Op) {
        match op {
            Op::Create => {
                self.moved_dirs.remove(&path);
                self.register_created(&path);
            }
            // A renamed directory's own watch reports the move after its parent did
            Op::Rename if !self.watched.contains(&path) && self.moved_dirs.remove(&path) => {
                return;
            }
            Op::Rename => {
                if self.watched.contains(&path)
                    && path.parent().is_some_and(|p| self.watched.contains(p))
                {
                    self.moved_dirs.insert(path.clone());
                }
                self.forget_subtree(&path);
            }
            Op::Remove => self.forget_subtree(&path),
            Op::Write | Op::Chmod => {}
        }
        self.pending.push_back(Event::new(path, op));
    }

    fn register_created(&mut self, path: &Path) {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return;
        };

        let result = if meta.file_type().is_symlink() {
            self.add_link(path)
        } else if meta.is_dir() {
            self.add_dir(path)
        } else {
            return;
        };

        match result {
            Ok(()) => {}
            Err(WatchError::Registration { ref source, .. }) if is_vanished(source) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch created path"),
        }
    }

    /// Re-resolve a link after its target was replaced
    fn relink(&mut self, link: &Path) -> bool {
        let target = match fs::canonicalize(link) {
            Ok(target) => target,
            Err(e) => {
                debug!(link = %link.display(), error = %e, "Symlink target vanished");
                return false;
            }
        };
        if self.links.get(link) == Some(&target) {
            return true;
        }
        match self.track_target(link, target) {
            Ok(()) => true,
            Err(e) => {
                warn!(link = %link.display(), error = %e, "Failed to follow new symlink target");
                false
            }
        }
    }

    fn is_visible(&self, path: &Path) -> bool {
        self.watched.contains(path) || path.parent().is_some_and(|p| self.watched.contains(p))
    }

    fn watch_path(&self, path: &Path) -> Result<()> {
        let mut guard = self
            .shared
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let watcher = guard.as_mut().ok_or_else(|| WatchError::Registration {
            path: path.to_path_buf(),
            source: notify::Error::generic("watcher is closed"),
        })?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Registration {
                path: path.to_path_buf(),
                source,
            })
    }

    fn unwatch_path(&self, path: &Path) {
        let mut guard = self
            .shared
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(watcher) = guard.as_mut() {
            // The kernel drops watches on deleted directories by itself
            let _ = watcher.unwatch(path);
        }
    }
}

impl Drop for SymlinkWatcher {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn registration_error(path: &Path, e: std::io::Error) -> WatchError {
    WatchError::Registration {
        path: path.to_path_buf(),
        source: notify::Error::io(e),
    }
}

fn is_vanished(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::PathNotFound => true,
        notify::ErrorKind::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}
