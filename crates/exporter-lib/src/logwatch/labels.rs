//! Container identity extraction from pod log paths
//!
//! Kubelet lays out container logs as
//! `<root>/<namespace>_<podname>_<poduuid>/<containername>/<n>.log`.
//! The rotating `<n>.log` part is not a label, so all rotated files of one
//! container share a single counter series.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static LOG_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/([a-z0-9-]+)_([a-z0-9-]+)_([a-f0-9-]+)/([a-z0-9-]+)/.*\.log")
        .expect("log file pattern is valid")
});

static POD_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/([a-z0-9-]+)_([a-z0-9-]+)_([a-f0-9-]+)$").expect("pod dir pattern is valid")
});

/// Label names of the byte counter, in the order of [`LogLabels::values`]
pub const LABEL_NAMES: [&str; 4] = ["namespace", "podname", "poduuid", "containername"];

/// Identity of the container a log file belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogLabels {
    pub namespace: String,
    pub name: String,
    pub uuid: String,
    pub container: String,
}

impl LogLabels {
    /// Extract labels from a container log file path
    pub fn parse(path: &Path) -> Option<Self> {
        let path = path.to_string_lossy();
        let caps = LOG_FILE.captures(&path)?;

        Some(Self {
            namespace: caps[1].to_string(),
            name: caps[2].to_string(),
            uuid: caps[3].to_string(),
            container: caps[4].to_string(),
        })
    }

    /// Label values in [`LABEL_NAMES`] order
    pub fn values(&self) -> [&str; 4] {
        [&self.namespace, &self.name, &self.uuid, &self.container]
    }
}

/// Returns true if `path` is a pod log directory
/// (`<root>/<namespace>_<podname>_<poduuid>` with nothing after it)
pub fn is_pod_dir(path: &Path) -> bool {
    POD_DIR.is_match(&path.to_string_lossy())
}
