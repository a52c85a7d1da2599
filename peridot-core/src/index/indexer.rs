//! Background import of the remote listing into the index store.
//!
//! One run at a time: `start` claims the indexing flag with a compare-and-set
//! and spawns a worker task that streams the lister subprocess's stdout
//! through [`RecordSplitter`], committing entries in batches of 500.
//! Cancellation is cooperative and lossless up to the last full batch.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::index::lister::{ensure_valid_cwd, locate_lister};
use crate::index::records::{RecordSplitter, parse_record};
use crate::index::store::FileIndex;
use crate::index::types::IndexedEntry;

/// How long a single pipe read may block before the stop flag is rechecked.
const READ_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Snapshot of a running (or finished) index pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexProgress {
    pub is_indexing: bool,
    pub percent: u8,
    pub status: String,
}

#[derive(Debug, Default)]
struct ProgressCell {
    percent: AtomicU8,
    status: Mutex<String>,
}

impl ProgressCell {
    fn report(&self, percent: u8, status: impl Into<String>) {
        let status = status.into();
        debug!("index progress {percent}%: {status}");
        self.percent.store(percent, Ordering::Relaxed);
        *self.status.lock().expect("progress lock poisoned") = status;
    }
}

pub struct RemoteIndexer {
    index: Arc<FileIndex>,
    remote: String,
    lister_override: Option<PathBuf>,
    batch_size: usize,
    is_indexing: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    progress: Arc<ProgressCell>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIndexer")
            .field("remote", &self.remote)
            .field("is_indexing", &self.is_indexing.load(Ordering::Relaxed))
            .finish()
    }
}

impl RemoteIndexer {
    pub fn new(index: Arc<FileIndex>, config: &EngineConfig) -> Self {
        Self {
            index,
            remote: config.remote.clone(),
            lister_override: config.lister_path.clone(),
            batch_size: config.index_batch_size.max(1),
            is_indexing: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(ProgressCell::default()),
            task: Mutex::new(None),
        }
    }

    /// Begin a background index pass. At most one run may be in flight;
    /// concurrent attempts fail with [`EngineError::IndexingInProgress`].
    pub fn start(&self, full_reindex: bool) -> Result<()> {
        if self
            .is_indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("indexing already in progress, ignoring duplicate request");
            return Err(EngineError::IndexingInProgress);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.progress.report(0, "Starting index...");
        info!("started background indexing (full={full_reindex})");

        let worker = IndexWorker {
            index: self.index.clone(),
            remote: self.remote.clone(),
            lister_override: self.lister_override.clone(),
            batch_size: self.batch_size,
            is_indexing: self.is_indexing.clone(),
            stop_requested: self.stop_requested.clone(),
            progress: self.progress.clone(),
        };
        let handle = tokio::spawn(worker.run(full_reindex));

        // A previous handle can only be a finished run at this point.
        *self.task_slot() = Some(handle);
        Ok(())
    }

    /// Request cancellation and wait for the worker to flush and exit.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let handle = self.task_slot().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.is_indexing.store(false, Ordering::SeqCst);
    }

    pub fn is_indexing(&self) -> bool {
        self.is_indexing.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> IndexProgress {
        IndexProgress {
            is_indexing: self.is_indexing(),
            percent: self.progress.percent.load(Ordering::Relaxed),
            status: self
                .progress
                .status
                .lock()
                .expect("progress lock poisoned")
                .clone(),
        }
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().expect("indexer task lock poisoned")
    }
}

struct IndexWorker {
    index: Arc<FileIndex>,
    remote: String,
    lister_override: Option<PathBuf>,
    batch_size: usize,
    is_indexing: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    progress: Arc<ProgressCell>,
}

impl IndexWorker {
    async fn run(self, full_reindex: bool) {
        self.run_inner(full_reindex).await;
        self.is_indexing.store(false, Ordering::SeqCst);
    }

    async fn run_inner(&self, full_reindex: bool) {
        if !self.index.is_open() {
            error!("index store not initialized, aborting index run");
            self.progress.report(100, "Error: index not initialized");
            return;
        }

        if full_reindex {
            self.progress.report(5, "Clearing old index...");
            if let Err(e) = self.clear_entries().await {
                error!("failed to clear index before full re-index: {e}");
            }
        }

        self.progress.report(10, "Streaming file list from remote...");
        ensure_valid_cwd();

        let lister = locate_lister(self.lister_override.as_deref());
        let target = format!("{}:/", self.remote);
        let mut child = match Command::new(&lister)
            .args(["lsjson", "--recursive", "--fast-list", &target])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn lister {}: {e}", lister.display());
                self.progress.report(100, "Error: lister failed to start");
                return;
            }
        };

        let Some(mut stdout) = child.stdout.take() else {
            error!("lister stdout was not captured");
            self.progress.report(100, "Error: lister pipe failed");
            return;
        };

        let started = Instant::now();
        let mut splitter = RecordSplitter::new();
        let mut batch: Vec<IndexedEntry> = Vec::with_capacity(self.batch_size);
        let mut total_saved = 0usize;
        let mut buf = [0u8; 8192];

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                let _ = child.start_kill();
                if !batch.is_empty() {
                    total_saved += self.flush_batch(&mut batch).await;
                }
                info!("indexing cancelled, {total_saved} entries saved");
                self.progress
                    .report(100, format!("Cancelled after {total_saved} entries"));
                let _ = child.wait().await;
                return;
            }

            // Bounded read so a quiet pipe cannot delay cancellation.
            let n = match tokio::time::timeout(READ_POLL, stdout.read(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("reading lister output failed: {e}");
                    break;
                }
            };

            let remote = self.remote.as_str();
            splitter.feed(&buf[..n], |object| {
                if let Some(record) = parse_record(object) {
                    batch.push(record.into_entry(remote));
                }
            });

            if batch.len() >= self.batch_size {
                total_saved += self.flush_batch(&mut batch).await;
                let percent = (10 + total_saved / 100).min(90) as u8;
                let elapsed = started.elapsed().as_secs();
                self.progress
                    .report(percent, format!("Indexed {total_saved} files ({elapsed}s)..."));
            }
        }

        if !batch.is_empty() {
            total_saved += self.flush_batch(&mut batch).await;
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                debug!("lister exited with status {status}");
            }
            Err(e) => debug!("failed to reap lister: {e}"),
            _ => {}
        }

        let elapsed = started.elapsed().as_secs();
        info!("streaming complete: {total_saved} entries in {elapsed}s");

        if total_saved == 0 {
            error!("lister produced no records");
            self.progress.report(100, "Error: no files found in remote");
            return;
        }

        self.progress.report(95, "Updating statistics...");
        if let Err(e) = self.mark_complete().await {
            error!("failed to record index completion: {e}");
        }
        self.progress
            .report(100, format!("Indexed {total_saved} items"));
    }

    /// Commit the pending batch off the async runtime, returning how many
    /// rows were written. The batch is left empty either way.
    async fn flush_batch(&self, batch: &mut Vec<IndexedEntry>) -> usize {
        let chunk = std::mem::take(batch);
        let index = self.index.clone();
        let outcome =
            tokio::task::spawn_blocking(move || index.insert_files_batch(&chunk)).await;
        match outcome {
            Ok(Ok(written)) => written,
            Ok(Err(e)) => {
                error!("batch insert failed: {e}");
                0
            }
            Err(e) => {
                error!("batch insert task failed: {e}");
                0
            }
        }
    }

    async fn clear_entries(&self) -> Result<()> {
        let index = self.index.clone();
        run_store_op(move || index.delete_all_entries()).await
    }

    async fn mark_complete(&self) -> Result<()> {
        let index = self.index.clone();
        run_store_op(move || index.mark_full_index_complete()).await
    }
}

async fn run_store_op<F>(op: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| EngineError::Internal(format!("store task failed: {e}")))?
}
