//! End-to-end tests for pod log watching
//!
//! Each test writes kubelet-style log files under a temporary root, runs a
//! [`LogWatcher`] on its own task and polls the exported counter.

use super::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const HELLO: &str = "hello\n";
const GOODBYE: &str = "goodbye\n";

struct Fixture {
    dir: TempDir,
    registry: Registry,
    handle: Option<LogWatcherHandle>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            registry: Registry::new(),
            handle: None,
            task: None,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create or append to a log
    fn log(&self, path: &Path, data: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    fn watch(&mut self) {
        let config = WatchConfig::new(self.dir.path());
        let mut watcher =
            LogWatcher::new(&config, self.registry.clone(), StructuredLogger::new("test-node"))
                .unwrap();
        self.handle = Some(watcher.handle());
        self.task = Some(tokio::spawn(async move { watcher.watch().await }));
    }

    fn handle(&self) -> &LogWatcherHandle {
        self.handle.as_ref().expect("watch() not called")
    }

    /// Current counter for the container owning `path`, absent counts as 0
    fn count(&self, path: &Path) -> u64 {
        assert!(LogLabels::parse(path).is_some(), "{}", path.display());
        self.handle().logged_bytes_for(path).unwrap_or(0)
    }

    async fn assert_counter_reaches(&self, path: &Path, want: u64) {
        let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        loop {
            let got = self.count(path);
            if got == want {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("want {want}, got {got}: {}", path.display());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Close the watcher and wait for its loop to return
    async fn close(&mut self) -> Result<()> {
        self.handle().close();
        let task = self.task.take().expect("watch() not called");
        tokio::time::timeout(POLL_TIMEOUT, task)
            .await
            .expect("watch loop did not stop")
            .unwrap()
    }
}

fn len(s: &str) -> u64 {
    s.len() as u64
}

#[tokio::test]
async fn test_watches_files() {
    let mut f = Fixture::new();

    // Created before the watch starts
    let before = f.path("before_loki-receiver_8cdbeb1b-f8bd-4c56-97d0-1d984060a846/loki-receiver/0.log");
    f.log(&before, HELLO);
    f.watch();

    for i in 1..3 {
        f.assert_counter_reaches(&before, i * len(HELLO)).await;
        f.log(&before, HELLO);
    }

    // Created after the watch starts
    let after = f.path("after_loki-server_efc2acf0-387d-4274-975f-d5f77a4ffb3e/loki-server/1.log");
    for i in 1..3 {
        f.log(&after, GOODBYE);
        f.assert_counter_reaches(&after, i * len(GOODBYE)).await;
    }

    // Removing the pod directory drops the series
    fs::remove_dir_all(before.parent().unwrap().parent().unwrap()).unwrap();
    f.assert_counter_reaches(&before, 0).await;
    assert_eq!(f.handle().logged_bytes_for(&before), None);
    // Other pods are unaffected
    assert_eq!(f.count(&after), 2 * len(GOODBYE));

    f.close().await.unwrap();
}

#[tokio::test]
async fn test_watches_multi_logs() {
    let mut f = Fixture::new();
    let pod = "somens_somepod_8cdbeb1b-f8bd-4c56-97d0-1d984060a846";

    let some0 = f.path(&format!("{pod}/somecontainer/0.log"));
    let some1 = f.path(&format!("{pod}/somecontainer/1.log"));
    let before3 = f.path(&format!("{pod}/beforecontainer/3.log"));
    let before4 = f.path(&format!("{pod}/beforecontainer/4.log"));

    f.log(&before3, HELLO);
    f.watch();

    // Existing files are counted
    f.assert_counter_reaches(&before3, len(HELLO)).await;
    // A new rotated file adds to the same series
    f.log(&before4, GOODBYE);
    f.assert_counter_reaches(&before3, len(HELLO) + len(GOODBYE)).await;

    // Several new files for one container
    f.log(&some0, HELLO);
    f.log(&some1, GOODBYE);
    f.assert_counter_reaches(&some0, len(HELLO) + len(GOODBYE)).await;

    f.log(&some0, HELLO);
    f.assert_counter_reaches(&some0, 2 * len(HELLO) + len(GOODBYE)).await;
    f.log(&some1, GOODBYE);
    f.assert_counter_reaches(&some0, 2 * len(HELLO) + 2 * len(GOODBYE)).await;

    // Deleting log files of a live pod leaves the counter alone
    let n = f.count(&some0);
    fs::remove_dir_all(some0.parent().unwrap()).unwrap();
    assert_eq!(f.count(&some0), n);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.count(&some0), n);

    // Recreating a log keeps adding to it
    f.log(&some0, HELLO);
    f.assert_counter_reaches(&some0, n + len(HELLO)).await;

    f.close().await.unwrap();
}

#[tokio::test]
async fn test_sibling_files_share_series() {
    let mut f = Fixture::new();
    f.watch();

    let pod = "ns_pod_0123abcd-4567-89ef-0123-456789abcdef";
    let one = f.path(&format!("{pod}/container/1.log"));
    let zero = f.path(&format!("{pod}/container/0.log"));

    f.log(&one, GOODBYE);
    f.assert_counter_reaches(&one, 8).await;
    f.log(&zero, HELLO);
    f.assert_counter_reaches(&one, 14).await;
    assert_eq!(f.count(&zero), 14);

    f.close().await.unwrap();
}

#[tokio::test]
async fn test_copy_truncate_rotation() {
    let mut f = Fixture::new();
    let log = f.path("ns_pod_0123abcd-4567-89ef-0123-456789abcdef/container/0.log");
    f.log(&log, "0123456789");
    f.watch();
    f.assert_counter_reaches(&log, 10).await;

    // Truncate in place, then keep writing
    OpenOptions::new()
        .write(true)
        .open(&log)
        .unwrap()
        .set_len(0)
        .unwrap();
    f.log(&log, "abc");

    // Whether the truncation is seen at size 0 or 3, the whole new size is
    // credited exactly once
    f.assert_counter_reaches(&log, 13).await;

    f.close().await.unwrap();
}

#[tokio::test]
async fn test_symlink_rotation() {
    let mut f = Fixture::new();
    let outside = TempDir::new().unwrap();
    let target = outside.path().join("0.log");
    fs::write(&target, "0123456789").unwrap();

    let log = f.path("ns_pod_0123abcd-4567-89ef-0123-456789abcdef/container/0.log");
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(&target, &log).unwrap();
    f.watch();
    f.assert_counter_reaches(&log, 10).await;

    // Rotate by moving a new file into the target's place
    let next = outside.path().join("next");
    fs::write(&next, "abc").unwrap();
    fs::rename(&next, &target).unwrap();
    f.assert_counter_reaches(&log, 13).await;

    f.log(&target, "de");
    f.assert_counter_reaches(&log, 15).await;

    f.close().await.unwrap();
}

#[tokio::test]
async fn test_close_unregisters_metrics() {
    let mut f = Fixture::new();
    let log = f.path("ns_pod_0123abcd-4567-89ef-0123-456789abcdef/container/0.log");
    f.log(&log, HELLO);
    f.watch();

    let names: Vec<String> = f
        .registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_string())
        .collect();
    assert!(names.contains(&crate::observability::LOGGED_BYTES_METRIC.to_string()));

    f.close().await.unwrap();
    assert!(f.registry.gather().is_empty());

    // A second watcher can use the same registry afterwards
    f.watch();
    f.assert_counter_reaches(&log, len(HELLO)).await;
    f.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_root_fails() {
    let f = Fixture::new();
    let config = WatchConfig::new(f.path("missing"));

    let result = LogWatcher::new(&config, f.registry.clone(), StructuredLogger::new("test-node"));
    assert!(matches!(result, Err(WatchError::Registration { .. })));
    // Nothing is left registered
    assert!(f.registry.gather().is_empty());
}

#[tokio::test]
async fn test_events_are_counted() {
    let mut f = Fixture::new();
    f.watch();

    let log = f.path("ns_pod_0123abcd-4567-89ef-0123-456789abcdef/container/0.log");
    f.log(&log, HELLO);
    f.assert_counter_reaches(&log, len(HELLO)).await;
    assert!(f.handle().metrics().events(Op::Create) >= 1);
    assert_eq!(f.handle().metrics().tracked_files(), 1);

    f.close().await.unwrap();
}
