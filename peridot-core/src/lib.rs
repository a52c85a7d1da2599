//! Core sync engine for the Peridot Drive Linux client.
//!
//! Maintains a searchable, encrypted local index of a remote file tree and
//! reacts to local filesystem changes to trigger sync operations. The GUI,
//! IPC and the transfer transport live in other crates; this one owns the
//! index store, the background indexer, the filesystem watcher and the
//! bandwidth/network monitors.

pub mod bandwidth;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod index;
pub mod network;
pub mod telemetry;
pub mod watcher;

pub use bandwidth::{BandwidthMonitor, SessionStats, TransferDirection, TransferRecord};
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{EngineError, Result};
pub use index::{FileIndex, IndexProgress, IndexStats, IndexedEntry, RemoteIndexer};
pub use network::NetworkMonitor;
pub use watcher::{SyncCallback, SyncWatcher};
