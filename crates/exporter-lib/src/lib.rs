//! Log file metric exporter library
//!
//! This crate provides the core functionality for:
//! - Symlink-transparent, self-extending filesystem watching
//! - Rotation-aware accounting of bytes written to container logs
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod logwatch;
pub mod observability;
pub mod symnotify;

pub use error::WatchError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use logwatch::{LogLabels, LogWatcher, LogWatcherHandle, WatchConfig};
pub use observability::{LogWatchMetrics, StructuredLogger};
