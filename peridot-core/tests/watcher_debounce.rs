//! Watcher behavior against a real filesystem: debounce coalescing,
//! temp-file filtering and subtree adoption.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use peridot_core::SyncWatcher;
use tempfile::TempDir;

const WINDOW: Duration = Duration::from_secs(3);

struct CallbackProbe {
    count: AtomicUsize,
    fired_at: Mutex<Vec<Instant>>,
}

impl CallbackProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            fired_at: Mutex::new(Vec::new()),
        })
    }

    fn install(self: &Arc<Self>, watcher: &SyncWatcher) {
        let probe = self.clone();
        watcher.set_sync_callback(Arc::new(move |_job| {
            probe.count.fetch_add(1, Ordering::SeqCst);
            probe.fired_at.lock().unwrap().push(Instant::now());
        }));
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_events_yields_one_callback_after_window() {
    let tmp = TempDir::new().unwrap();
    let watcher = SyncWatcher::new(WINDOW);
    let probe = CallbackProbe::new();
    probe.install(&watcher);

    watcher.start().unwrap();
    let dirs = watcher.add_watch("job-a", tmp.path()).unwrap();
    assert_eq!(dirs, 1);
    assert!(watcher.is_watching("job-a"));

    let mut last_event = Instant::now();
    for i in 0..5 {
        fs::write(tmp.path().join(format!("file{i}.txt")), b"contents").unwrap();
        last_event = Instant::now();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    tokio::time::sleep(WINDOW + Duration::from_secs(2)).await;

    assert_eq!(probe.count(), 1, "burst must collapse into one sync");
    let fired = probe.fired_at.lock().unwrap()[0];
    let delay = fired.duration_since(last_event);
    assert!(delay >= WINDOW, "fired {delay:?} after last event, before the window");
    assert!(
        delay <= WINDOW + Duration::from_secs(1),
        "fired {delay:?} after last event, long past the window"
    );

    watcher.stop().await;
    assert!(!watcher.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hidden_and_temp_files_do_not_trigger() {
    let tmp = TempDir::new().unwrap();
    let watcher = SyncWatcher::new(Duration::from_secs(1));
    let probe = CallbackProbe::new();
    probe.install(&watcher);

    watcher.start().unwrap();
    watcher.add_watch("job-b", tmp.path()).unwrap();

    fs::write(tmp.path().join(".foo"), b"hidden").unwrap();
    fs::write(tmp.path().join("foo.swp"), b"swap").unwrap();
    fs::write(tmp.path().join("dl.mkv.part"), b"partial").unwrap();
    fs::write(tmp.path().join("backup~"), b"editor").unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(probe.count(), 0);

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_subdirectory_is_adopted() {
    let tmp = TempDir::new().unwrap();
    let watcher = SyncWatcher::new(Duration::from_secs(1));
    let probe = CallbackProbe::new();
    probe.install(&watcher);

    watcher.start().unwrap();
    watcher.add_watch("job-c", tmp.path()).unwrap();

    let subdir = tmp.path().join("incoming");
    fs::create_dir(&subdir).unwrap();
    // Give the reader a moment to adopt the new directory.
    tokio::time::sleep(Duration::from_millis(500)).await;
    fs::write(subdir.join("dropped.txt"), b"payload").unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(probe.count(), 1, "directory + file events coalesce per job");
    assert_eq!(watcher.watch_status("job-c"), "Watching (2 dirs)");

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_watch_drops_pending_sync() {
    let tmp = TempDir::new().unwrap();
    let watcher = SyncWatcher::new(Duration::from_secs(1));
    let probe = CallbackProbe::new();
    probe.install(&watcher);

    watcher.start().unwrap();
    watcher.add_watch("job-d", tmp.path()).unwrap();

    fs::write(tmp.path().join("pending.txt"), b"x").unwrap();
    // Let the event reach the pending map, then unregister before it fires.
    tokio::time::sleep(Duration::from_millis(300)).await;
    watcher.remove_watch("job-d");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(probe.count(), 0);
    assert!(!watcher.is_watching("job-d"));
    assert_eq!(watcher.watch_status("job-d"), "Not watching");

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_root_registers_as_noop() {
    let tmp = TempDir::new().unwrap();
    let watcher = SyncWatcher::new(WINDOW);

    watcher.start().unwrap();
    let dirs = watcher
        .add_watch("job-e", tmp.path().join("never-created"))
        .unwrap();
    assert_eq!(dirs, 0);
    assert!(watcher.is_watching("job-e"));

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hidden_subdirectories_are_not_walked() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("visible")).unwrap();
    fs::create_dir(tmp.path().join(".git")).unwrap();
    fs::create_dir(tmp.path().join(".git").join("objects")).unwrap();

    let watcher = SyncWatcher::new(WINDOW);
    watcher.start().unwrap();
    let dirs = watcher.add_watch("job-f", tmp.path()).unwrap();
    // Root plus `visible`; the hidden tree is skipped entirely.
    assert_eq!(dirs, 2);

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reregistering_a_job_replaces_the_previous_watch() {
    let tmp = TempDir::new().unwrap();
    let root_a = tmp.path().join("a");
    let root_b = tmp.path().join("b");
    fs::create_dir_all(&root_a).unwrap();
    fs::create_dir_all(&root_b).unwrap();

    let watcher = SyncWatcher::new(Duration::from_secs(1));
    let probe = CallbackProbe::new();
    probe.install(&watcher);

    watcher.start().unwrap();
    watcher.add_watch("job-g", &root_a).unwrap();
    watcher.add_watch("job-g", &root_b).unwrap();

    // Events under the replaced root must not fire for the job.
    fs::write(root_a.join("stale.txt"), b"x").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(probe.count(), 0);

    fs::write(root_b.join("fresh.txt"), b"y").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(probe.count(), 1);

    watcher.stop().await;
}
