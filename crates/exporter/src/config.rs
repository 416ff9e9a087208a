//! Exporter configuration

use anyhow::Result;
use exporter_lib::WatchConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Exporter configuration, read from `EXPORTER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Root of the pod log tree
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// HTTP port for metrics and probes
    #[serde(default = "default_port")]
    pub port: u16,

    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Maximum directory nesting followed under `dir`
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_dir() -> PathBuf {
    PathBuf::from("/var/log/pods")
}

fn default_port() -> u16 {
    2112
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_max_depth() -> usize {
    WatchConfig::default().max_depth
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            port: default_port(),
            node_name: default_node_name(),
            max_depth: default_max_depth(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EXPORTER").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            dir: self.dir.clone(),
            max_depth: self.max_depth,
        }
    }
}
