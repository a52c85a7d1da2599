//! Engine configuration and platform paths.

use directories::ProjectDirs;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

pub const APP_NAME: &str = "peridot-drive";
pub const DB_FILE_NAME: &str = "file_index.db";
pub const KEYFILE_NAME: &str = ".keyfile";

/// How many entries the indexer buffers before committing a batch.
pub const DEFAULT_INDEX_BATCH: usize = 500;

fn default_remote() -> String {
    "peridot".to_string()
}

fn default_probe_url() -> String {
    "https://connectivitycheck.gstatic.com/generate_204".to_string()
}

fn default_interfaces() -> Vec<String> {
    ["eth0", "enp0s3", "wlan0", "wlp2s0", "eno1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_debounce_secs() -> u64 {
    3
}

fn default_batch_size() -> usize {
    DEFAULT_INDEX_BATCH
}

/// Engine-wide configuration. All fields have working defaults; hosts
/// typically only set `remote`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Short name of the remote namespace, addressed as `<remote>:/`.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Explicit path to the lister binary. When unset, discovery runs
    /// through the bundled/system/PATH ladder.
    #[serde(default)]
    pub lister_path: Option<PathBuf>,

    /// Entries buffered per index transaction.
    #[serde(default = "default_batch_size")]
    pub index_batch_size: usize,

    /// Quiet period after the last filesystem event before a sync fires.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// HTTPS endpoint for the connectivity fallback probe.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Interfaces checked for kernel carrier state, in order.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    /// Optional append-mode log file, enabled by the host at startup.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Override for the cache directory (index database). Tests use this;
    /// production resolves through the platform directories.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Override for the data directory (keyfile).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            lister_path: None,
            index_batch_size: default_batch_size(),
            debounce_secs: default_debounce_secs(),
            probe_url: default_probe_url(),
            interfaces: default_interfaces(),
            log_file: None,
            cache_dir: None,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. A missing file means defaults;
    /// a malformed one is an error rather than a silent fallback.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| EngineError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Configuration rooted at explicit directories, bypassing the platform
    /// lookup. Used by tests and portable installs.
    pub fn with_base_dirs(cache_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Resolve the index database path (`$XDG_CACHE_HOME/peridot-drive/...`).
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_cache_dir()?.join(DB_FILE_NAME))
    }

    /// Resolve the keyfile path (`$XDG_DATA_HOME/peridot-drive/.keyfile`).
    pub fn keyfile_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_data_dir()?.join(KEYFILE_NAME))
    }

    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.cache_dir().to_path_buf())
    }

    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.data_dir().to_path_buf())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
        .ok_or_else(|| EngineError::Config("unable to determine platform directories".into()))
}
