//! The host-facing surface: one value owning every engine component.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::bandwidth::BandwidthMonitor;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::index::{FileIndex, IndexProgress, IndexStats, IndexedEntry, RemoteIndexer};
use crate::network::{NetworkMonitor, StatusCallback};
use crate::watcher::{SyncCallback, SyncWatcher};

/// The sync engine. Hosts construct one, call [`initialize`], wire their
/// callbacks, and drive everything else through this type. All methods are
/// callable from any thread; the index store serializes internally.
///
/// [`initialize`]: SyncEngine::initialize
pub struct SyncEngine {
    config: EngineConfig,
    index: Arc<FileIndex>,
    indexer: RemoteIndexer,
    watcher: SyncWatcher,
    bandwidth: BandwidthMonitor,
    network: NetworkMonitor,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.config.remote)
            .field("indexer", &self.indexer)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let index = Arc::new(FileIndex::new(&config)?);
        let indexer = RemoteIndexer::new(index.clone(), &config);
        let watcher = SyncWatcher::new(config.debounce_window());
        let network = NetworkMonitor::new(&config);
        Ok(Self {
            config,
            index,
            indexer,
            watcher,
            bandwidth: BandwidthMonitor::new(),
            network,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the encrypted index and start the watcher and network monitor.
    /// Must be called from within the tokio runtime that will own the
    /// background tasks.
    pub fn initialize(&self) -> Result<()> {
        self.index.initialize()?;
        self.watcher.start()?;
        self.network.start();
        info!("sync engine initialized for remote {}", self.config.remote);
        Ok(())
    }

    /// Stop every background worker, then close and encrypt the index.
    /// Idempotent, and tolerant of a partially initialized engine.
    pub async fn shutdown(&self) {
        info!("sync engine shutting down");
        self.indexer.stop().await;
        self.watcher.stop().await;
        self.network.stop().await;
        self.index.shutdown();
        info!("sync engine shutdown complete");
    }

    // ---- index queries -------------------------------------------------

    pub fn search(&self, query: &str, limit: i64, include_folders: bool) -> Vec<IndexedEntry> {
        self.index.search(query, limit, include_folders)
    }

    pub fn search_with_filters(
        &self,
        query: &str,
        extension_csv: &str,
        path_prefix: &str,
        synced_only: bool,
        cloud_only: bool,
        limit: i64,
    ) -> Vec<IndexedEntry> {
        self.index
            .search_with_filters(query, extension_csv, path_prefix, synced_only, cloud_only, limit)
    }

    pub fn directory_contents(&self, path: &str) -> Vec<IndexedEntry> {
        self.index.get_directory_contents(path)
    }

    pub fn recent_files(&self, limit: i64) -> Vec<IndexedEntry> {
        self.index.get_recent_files(limit)
    }

    /// Store counts and stamps, overlaid with the live indexer state.
    pub fn stats(&self) -> IndexStats {
        let mut stats = self.index.stats();
        let progress = self.indexer.snapshot();
        stats.is_indexing = progress.is_indexing;
        stats.progress_percent = progress.percent;
        stats.status = if progress.is_indexing {
            "Indexing...".to_string()
        } else {
            "Idle".to_string()
        };
        stats
    }

    pub fn update_sync_status(&self, remote_path: &str, is_synced: bool, local_path: &str) -> Result<()> {
        self.index.update_sync_status(remote_path, is_synced, local_path)
    }

    pub fn prune_stale_entries(&self, parent_path: &str, paths_seen: &[String]) -> Result<usize> {
        self.index.prune_stale_entries(parent_path, paths_seen)
    }

    pub fn clear_index(&self) -> Result<()> {
        self.index.clear_index()
    }

    // ---- background indexing ------------------------------------------

    pub fn start_index(&self, full_reindex: bool) -> Result<()> {
        self.indexer.start(full_reindex)
    }

    pub async fn stop_index(&self) {
        self.indexer.stop().await;
    }

    pub fn is_indexing(&self) -> bool {
        self.indexer.is_indexing()
    }

    pub fn index_progress(&self) -> IndexProgress {
        self.indexer.snapshot()
    }

    // ---- watcher -------------------------------------------------------

    pub fn set_sync_callback(&self, callback: SyncCallback) {
        self.watcher.set_sync_callback(callback);
    }

    pub fn add_watch(&self, job_id: &str, root: impl AsRef<std::path::Path>) -> Result<usize> {
        self.watcher.add_watch(job_id, root)
    }

    pub fn remove_watch(&self, job_id: &str) {
        self.watcher.remove_watch(job_id);
    }

    pub fn is_watching(&self, job_id: &str) -> bool {
        self.watcher.is_watching(job_id)
    }

    pub fn watch_status(&self, job_id: &str) -> String {
        self.watcher.watch_status(job_id)
    }

    pub fn watcher_running(&self) -> bool {
        self.watcher.is_running()
    }

    pub fn set_debounce_window(&self, window: Duration) {
        self.watcher.set_debounce_window(window);
    }

    // ---- monitors ------------------------------------------------------

    /// Transfer lifecycle, speeds, limits and session stats.
    pub fn bandwidth(&self) -> &BandwidthMonitor {
        &self.bandwidth
    }

    /// Online/metered state.
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn set_network_callback(&self, callback: StatusCallback) {
        self.network.set_status_callback(callback);
    }
}
