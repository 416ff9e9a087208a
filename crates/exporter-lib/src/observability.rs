//! Observability infrastructure for the log file metric exporter
//!
//! Provides:
//! - Prometheus metrics bound to an explicit registry (logged bytes per
//!   container plus watcher self-metrics)
//! - Structured JSON logging with tracing

use crate::logwatch::{LogLabels, LABEL_NAMES};
use crate::symnotify::Op;
use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::{info, warn};

/// Name of the exported per-container byte counter
pub const LOGGED_BYTES_METRIC: &str = "log_logged_bytes_total";

/// Metrics maintained by a [`crate::logwatch::LogWatcher`].
///
/// Cloning is cheap and clones share the underlying series.
#[derive(Clone)]
pub struct LogWatchMetrics {
    logged_bytes: IntCounterVec,
    events: IntCounterVec,
    update_errors: IntCounter,
    tracked_files: IntGauge,
}

impl LogWatchMetrics {
    /// Create unregistered metrics
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            logged_bytes: IntCounterVec::new(
                Opts::new(
                    LOGGED_BYTES_METRIC,
                    "Total number of bytes written to a single log file path, accounting for rotations",
                ),
                &LABEL_NAMES,
            )?,
            events: IntCounterVec::new(
                Opts::new(
                    "log_watcher_events_total",
                    "Filesystem events consumed by the log watcher",
                ),
                &["op"],
            )?,
            update_errors: IntCounter::new(
                "log_watcher_update_errors_total",
                "Failed attempts to stat a log file",
            )?,
            tracked_files: IntGauge::new(
                "log_watcher_tracked_files",
                "Number of log file paths with a recorded size",
            )?,
        })
    }

    fn collectors(&self) -> [Box<dyn Collector>; 4] {
        [
            Box::new(self.logged_bytes.clone()),
            Box::new(self.events.clone()),
            Box::new(self.update_errors.clone()),
            Box::new(self.tracked_files.clone()),
        ]
    }

    /// Register every metric with `registry`.
    ///
    /// On failure the metrics registered by this call are removed again.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for (i, collector) in self.collectors().into_iter().enumerate() {
            if let Err(e) = registry.register(collector) {
                for done in self.collectors().into_iter().take(i) {
                    let _ = registry.unregister(done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove every metric from `registry`, ignoring ones that are not registered
    pub fn unregister(&self, registry: &Registry) {
        for collector in self.collectors() {
            let _ = registry.unregister(collector);
        }
    }

    /// Credit `bytes` to the container identified by `labels`.
    ///
    /// The series is created even when `bytes` is zero.
    pub fn add_logged_bytes(&self, labels: &LogLabels, bytes: u64) {
        self.logged_bytes
            .with_label_values(&labels.values())
            .inc_by(bytes);
    }

    /// Drop the series for `labels` entirely
    pub fn remove_logged_bytes(&self, labels: &LogLabels) {
        // Several files of one container map to the same series
        let _ = self.logged_bytes.remove_label_values(&labels.values());
    }

    /// Read the byte counter for `labels` without creating the series
    pub fn logged_bytes(&self, labels: &LogLabels) -> Option<u64> {
        let wanted = labels.values();
        self.logged_bytes
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let pairs = metric.get_label();
                LABEL_NAMES.iter().zip(wanted).all(|(name, value)| {
                    pairs
                        .iter()
                        .any(|p| p.get_name() == *name && p.get_value() == value)
                })
            })
            .map(|metric| metric.get_counter().get_value() as u64)
    }

    pub fn inc_event(&self, op: Op) {
        self.events.with_label_values(&[op.as_str()]).inc();
    }

    pub fn inc_update_errors(&self) {
        self.update_errors.inc();
    }

    pub fn set_tracked_files(&self, count: usize) {
        self.tracked_files.set(count as i64);
    }

    pub fn events(&self, op: Op) -> u64 {
        self.events.with_label_values(&[op.as_str()]).get()
    }

    pub fn update_errors(&self) -> u64 {
        self.update_errors.get()
    }

    pub fn tracked_files(&self) -> i64 {
        self.tracked_files.get()
    }
}

/// Structured logger for exporter lifecycle events
///
/// Provides consistent JSON-formatted records tagged with an `event` field.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, dir: &str) {
        info!(
            event = "exporter_started",
            node = %self.node_name,
            version = %version,
            dir = %dir,
            "Log file metric exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Log file metric exporter shutting down"
        );
    }

    /// Log removal of a pod log directory and its series
    pub fn log_pod_removed(&self, pod_dir: &str, files: usize) {
        info!(
            event = "pod_removed",
            node = %self.node_name,
            pod_dir = %pod_dir,
            files = files,
            "Pod log directory removed, dropped its series"
        );
    }

    /// Log a fatal watcher failure
    pub fn log_watcher_failed(&self, error: &str) {
        warn!(
            event = "watcher_failed",
            node = %self.node_name,
            error = %error,
            "Log watcher stopped, metrics are no longer updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(container: &str) -> LogLabels {
        LogLabels {
            namespace: "ns".to_string(),
            name: "pod".to_string(),
            uuid: "0123-abcd".to_string(),
            container: container.to_string(),
        }
    }

    #[test]
    fn test_logged_bytes_absent_until_added() {
        let metrics = LogWatchMetrics::new().unwrap();
        let l = labels("c");

        assert_eq!(metrics.logged_bytes(&l), None);
        metrics.add_logged_bytes(&l, 0);
        assert_eq!(metrics.logged_bytes(&l), Some(0));
        metrics.add_logged_bytes(&l, 6);
        assert_eq!(metrics.logged_bytes(&l), Some(6));
        assert_eq!(metrics.logged_bytes(&labels("other")), None);
    }

    #[test]
    fn test_remove_logged_bytes() {
        let metrics = LogWatchMetrics::new().unwrap();
        let l = labels("c");

        metrics.add_logged_bytes(&l, 12);
        metrics.remove_logged_bytes(&l);
        assert_eq!(metrics.logged_bytes(&l), None);
        // Removing twice is harmless
        metrics.remove_logged_bytes(&l);
    }

    #[test]
    fn test_independent_registries() {
        let first = Registry::new();
        let second = Registry::new();

        let a = LogWatchMetrics::new().unwrap();
        let b = LogWatchMetrics::new().unwrap();
        a.register(&first).unwrap();
        b.register(&second).unwrap();

        // Same names on one registry collide
        assert!(LogWatchMetrics::new().unwrap().register(&first).is_err());

        a.unregister(&first);
        assert!(first.gather().is_empty());
        LogWatchMetrics::new().unwrap().register(&first).unwrap();
    }

    #[test]
    fn test_failed_register_leaves_registry_clean() {
        let registry = Registry::new();
        // Conflicts with the last metric registered
        let taken = IntGauge::new("log_watcher_tracked_files", "Taken").unwrap();
        registry.register(Box::new(taken.clone())).unwrap();

        assert!(LogWatchMetrics::new().unwrap().register(&registry).is_err());

        registry.unregister(Box::new(taken)).unwrap();
        assert!(registry.gather().is_empty());
        LogWatchMetrics::new().unwrap().register(&registry).unwrap();
    }

    #[test]
    fn test_self_metrics() {
        let metrics = LogWatchMetrics::new().unwrap();
        metrics.inc_event(Op::Write);
        metrics.inc_event(Op::Write);
        metrics.inc_update_errors();
        metrics.set_tracked_files(3);

        assert_eq!(metrics.events(Op::Write), 2);
        assert_eq!(metrics.update_errors(), 1);
        assert_eq!(metrics.tracked_files(), 3);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
