//! Filesystem watching with per-job debounce.
//!
//! Each sync job registers a root directory; the watcher subscribes every
//! non-hidden subdirectory individually so the per-job watch set stays
//! observable and newly created subtrees can be adopted on the fly. Events
//! only ever bump a per-job timestamp; a 500 ms tick task promotes jobs that
//! have been quiet for the debounce window into a single sync callback, so a
//! burst of events produces one trigger.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::event::{AccessKind, AccessMode, CreateKind, EventKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};

pub type SyncCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Name fragments of editor temporaries and partial downloads that never
/// trigger a sync.
const IGNORED_FRAGMENTS: &[&str] = &[".swp", ".tmp", "~", ".part"];

const TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct JobWatch {
    root: PathBuf,
    dirs: HashSet<PathBuf>,
}

#[derive(Default)]
struct WatcherShared {
    running: AtomicBool,
    debounce: Mutex<Duration>,
    watches: Mutex<HashMap<String, JobWatch>>,
    // Separate lock so callbacks never run while the watch maps are held.
    pending: Mutex<HashMap<String, Instant>>,
    callback: Mutex<Option<SyncCallback>>,
}

struct WatcherRuntime {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    reader: JoinHandle<()>,
    debouncer: JoinHandle<()>,
}

pub struct SyncWatcher {
    shared: Arc<WatcherShared>,
    runtime: Mutex<Option<WatcherRuntime>>,
}

impl std::fmt::Debug for SyncWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.shared.watches.lock().map(|w| w.len()).unwrap_or(0);
        f.debug_struct("SyncWatcher")
            .field("running", &self.is_running())
            .field("jobs", &jobs)
            .finish()
    }
}

impl Default for SyncWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl SyncWatcher {
    pub fn new(debounce_window: Duration) -> Self {
        let shared = WatcherShared {
            debounce: Mutex::new(debounce_window),
            ..WatcherShared::default()
        };
        Self {
            shared: Arc::new(shared),
            runtime: Mutex::new(None),
        }
    }

    /// Register the function invoked (from the debounce task) when a job's
    /// files have settled.
    pub fn set_sync_callback(&self, callback: SyncCallback) {
        *self.shared.callback.lock().expect("watcher lock poisoned") = Some(callback);
    }

    pub fn set_debounce_window(&self, window: Duration) {
        *self.shared.debounce.lock().expect("watcher lock poisoned") = window;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the kernel-notification reader and the debounce tick task.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().expect("watcher lock poisoned");
        if runtime.is_some() {
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(e) => error!("watch error: {e}"),
        })?;
        let watcher = Arc::new(Mutex::new(watcher));

        self.shared.running.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(reader_loop(
            self.shared.clone(),
            watcher.clone(),
            event_rx,
        ));
        let debouncer = tokio::spawn(debounce_loop(self.shared.clone()));

        *runtime = Some(WatcherRuntime {
            watcher,
            reader,
            debouncer,
        });
        info!("file watcher started");
        Ok(())
    }

    /// Stop both tasks and drop every registration.
    pub async fn stop(&self) {
        let taken = {
            let mut runtime = self.runtime.lock().expect("watcher lock poisoned");
            self.shared.running.store(false, Ordering::SeqCst);
            runtime.take()
        };
        let Some(runtime) = taken else {
            return;
        };

        self.shared
            .watches
            .lock()
            .expect("watcher lock poisoned")
            .clear();
        self.shared
            .pending
            .lock()
            .expect("watcher lock poisoned")
            .clear();

        // The reader also holds the notify handle, so it is stopped at its
        // await point; the debouncer sees the cleared flag within one tick.
        runtime.reader.abort();
        let _ = runtime.reader.await;
        let _ = runtime.debouncer.await;
        drop(runtime.watcher);
        info!("file watcher stopped");
    }

    /// Watch `root` and all of its non-hidden subdirectories for `job_id`,
    /// replacing any previous registration for the job. A missing root is a
    /// silent no-op. Returns the number of directories registered.
    pub fn add_watch(&self, job_id: &str, root: impl AsRef<Path>) -> Result<usize> {
        let root = root.as_ref();
        self.remove_watch(job_id);

        let runtime = self.runtime.lock().expect("watcher lock poisoned");
        let Some(runtime) = runtime.as_ref() else {
            return Err(EngineError::Watch("watcher is not running".into()));
        };

        let mut job = JobWatch {
            root: root.to_path_buf(),
            dirs: HashSet::new(),
        };

        let walked = if root.exists() {
            let mut watcher = runtime.watcher.lock().expect("watcher lock poisoned");
            watch_tree(&mut watcher, root, &mut job.dirs)
        } else {
            Ok(())
        };

        // Even a walk aborted by the descriptor quota keeps what it managed
        // to register, so the job stays removable and partially watched.
        let count = job.dirs.len();
        self.shared
            .watches
            .lock()
            .expect("watcher lock poisoned")
            .insert(job_id.to_string(), job);
        walked?;

        info!("added watch for job {job_id} ({count} directories)");
        Ok(count)
    }

    /// Drop all descriptors for a job along with any pending sync.
    pub fn remove_watch(&self, job_id: &str) {
        let runtime = self.runtime.lock().expect("watcher lock poisoned");
        let removed = self
            .shared
            .watches
            .lock()
            .expect("watcher lock poisoned")
            .remove(job_id);

        if let Some(job) = removed {
            if let Some(runtime) = runtime.as_ref() {
                let mut watcher = runtime.watcher.lock().expect("watcher lock poisoned");
                for dir in &job.dirs {
                    let _ = watcher.unwatch(dir);
                }
            }
            self.shared
                .pending
                .lock()
                .expect("watcher lock poisoned")
                .remove(job_id);
            info!("removed watch for job {job_id}");
        }
    }

    pub fn is_watching(&self, job_id: &str) -> bool {
        self.shared
            .watches
            .lock()
            .expect("watcher lock poisoned")
            .contains_key(job_id)
    }

    pub fn watch_status(&self, job_id: &str) -> String {
        let watches = self.shared.watches.lock().expect("watcher lock poisoned");
        match watches.get(job_id) {
            Some(job) => format!("Watching ({} dirs)", job.dirs.len()),
            None => "Not watching".to_string(),
        }
    }
}

/// Subscribe every non-hidden directory under `root`, recording each in
/// `dirs`. Unreadable subtrees are skipped; hitting the kernel watch quota
/// aborts with an error, leaving already-registered directories in place.
fn watch_tree(
    watcher: &mut RecommendedWatcher,
    root: &Path,
    dirs: &mut HashSet<PathBuf>,
) -> Result<()> {
    let walk = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name().to_string_lossy().as_ref()));

    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable path during watch walk: {e}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        match watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                dirs.insert(path.to_path_buf());
            }
            Err(e) => match &e.kind {
                notify::ErrorKind::Io(io) if io.raw_os_error() == Some(libc_enospc()) => {
                    error!(
                        "kernel watch limit reached at {} - raise fs.inotify.max_user_watches",
                        path.display()
                    );
                    return Err(EngineError::Watch("watch descriptor quota exhausted".into()));
                }
                notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                    debug!("skipping {} (permission denied)", path.display());
                }
                notify::ErrorKind::PathNotFound => {}
                _ => warn!("failed to watch {}: {e}", path.display()),
            },
        }
    }
    Ok(())
}

const fn libc_enospc() -> i32 {
    28
}

async fn reader_loop(
    shared: Arc<WatcherShared>,
    watcher: Arc<Mutex<RecommendedWatcher>>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    debug!("watch reader started");
    while let Some(event) = events.recv().await {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        handle_event(&shared, &watcher, event);
    }
    debug!("watch reader ended");
}

fn handle_event(
    shared: &Arc<WatcherShared>,
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    event: Event,
) {
    if !is_sync_relevant(&event.kind) {
        return;
    }
    let Some(path) = event.paths.first() else {
        return;
    };

    if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
        if is_hidden_name(&name) || is_temp_name(&name) {
            return;
        }
    }

    let job_id = {
        let watches = shared.watches.lock().expect("watcher lock poisoned");
        job_for_path(&watches, path)
    };
    let Some(job_id) = job_id else {
        return;
    };

    // A freshly created directory gets its whole subtree adopted so events
    // below it are seen from now on.
    let created_dir = matches!(event.kind, EventKind::Create(CreateKind::Folder))
        || (matches!(event.kind, EventKind::Create(_)) && path.is_dir());
    if created_dir {
        debug!("new directory created: {}", path.display());
        let mut watcher = watcher.lock().expect("watcher lock poisoned");
        let mut watches = shared.watches.lock().expect("watcher lock poisoned");
        if let Some(job) = watches.get_mut(&job_id) {
            if let Err(e) = watch_tree(&mut watcher, path, &mut job.dirs) {
                warn!("could not adopt new subtree {}: {e}", path.display());
            }
        }
    }

    debug!("event {:?} on {} (job {job_id})", event.kind, path.display());
    schedule_sync(shared, &job_id);
}

/// Create, delete, modify, moves and close-after-write; everything else
/// (plain reads, metadata-only churn) is noise.
fn is_sync_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

fn is_temp_name(name: &str) -> bool {
    IGNORED_FRAGMENTS.iter().any(|frag| name.contains(frag))
}

fn job_for_path(watches: &HashMap<String, JobWatch>, path: &Path) -> Option<String> {
    watches
        .iter()
        .filter(|(_, job)| path.starts_with(&job.root))
        .max_by_key(|(_, job)| job.root.as_os_str().len())
        .map(|(id, _)| id.clone())
}

fn schedule_sync(shared: &Arc<WatcherShared>, job_id: &str) {
    let mut pending = shared.pending.lock().expect("watcher lock poisoned");
    let is_new = !pending.contains_key(job_id);
    pending.insert(job_id.to_string(), Instant::now());
    if is_new {
        debug!("scheduled sync for job {job_id}");
    }
}

async fn debounce_loop(shared: Arc<WatcherShared>) {
    debug!("debounce loop started");
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while shared.running.load(Ordering::SeqCst) {
        tick.tick().await;

        let window = *shared.debounce.lock().expect("watcher lock poisoned");
        let ready: Vec<String> = {
            let mut pending = shared.pending.lock().expect("watcher lock poisoned");
            let now = Instant::now();
            let ready: Vec<String> = pending
                .iter()
                .filter(|(_, last)| now.duration_since(**last) >= window)
                .map(|(job, _)| job.clone())
                .collect();
            for job in &ready {
                pending.remove(job);
            }
            ready
        };

        if ready.is_empty() {
            continue;
        }
        let callback = shared
            .callback
            .lock()
            .expect("watcher lock poisoned")
            .clone();
        let Some(callback) = callback else {
            continue;
        };
        for job_id in ready {
            info!("triggering sync for job {job_id} (file changes settled)");
            callback(&job_id);
        }
    }
    debug!("debounce loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_and_hidden_names_are_ignored() {
        for name in [".foo", ".git", "file.swp", "doc.tmp", "backup~", "movie.mkv.part"] {
            assert!(
                is_hidden_name(name) || is_temp_name(name),
                "{name} should be filtered"
            );
        }
        for name in ["notes.txt", "photo.jpg", "partition-map.ods"] {
            assert!(!is_hidden_name(name), "{name}");
        }
        assert!(!is_temp_name("report.pdf"));
    }

    #[test]
    fn longest_root_wins_for_nested_jobs() {
        let mut watches = HashMap::new();
        watches.insert(
            "outer".to_string(),
            JobWatch { root: PathBuf::from("/data"), dirs: HashSet::new() },
        );
        watches.insert(
            "inner".to_string(),
            JobWatch { root: PathBuf::from("/data/projects"), dirs: HashSet::new() },
        );

        assert_eq!(
            job_for_path(&watches, Path::new("/data/projects/a.txt")).as_deref(),
            Some("inner")
        );
        assert_eq!(
            job_for_path(&watches, Path::new("/data/other.txt")).as_deref(),
            Some("outer")
        );
        assert_eq!(job_for_path(&watches, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn relevant_event_kinds() {
        use notify::event::{ModifyKind, RemoveKind};
        assert!(is_sync_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_sync_relevant(&EventKind::Remove(RemoveKind::Any)));
        assert!(is_sync_relevant(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_sync_relevant(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_sync_relevant(&EventKind::Access(AccessKind::Read)));
        assert!(!is_sync_relevant(&EventKind::Any));
    }
}
