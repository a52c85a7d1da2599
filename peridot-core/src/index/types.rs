use serde::Serialize;

/// One remote file or directory in the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexedEntry {
    pub id: i64,
    /// Last path segment.
    pub name: String,
    /// Full remote path, globally unique (`<remote>:/dir/file.ext`).
    pub path: String,
    /// Path of the containing directory, or the remote root for top-level
    /// entries.
    pub parent_path: String,
    /// Size in bytes; -1 means unknown. Directories carry 0.
    pub size: i64,
    /// ISO-8601 local time at seconds precision, lexicographically sortable.
    pub mod_time: String,
    pub is_directory: bool,
    /// True iff a local copy is materialized.
    pub is_synced: bool,
    /// Filesystem path of the local copy when synced, else empty.
    pub local_path: String,
    /// Lowercased extension without the leading dot; empty if none.
    pub extension: String,
    /// BM25 relevance from full-text search; 0 outside FTS queries.
    pub relevance: f64,
}

/// Snapshot of index contents and indexer state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total_files: i64,
    pub total_folders: i64,
    pub total_size_bytes: i64,
    pub last_full_index: String,
    pub last_partial_index: String,
    pub is_indexing: bool,
    pub progress_percent: u8,
    pub status: String,
}

/// The remote root sentinel, `<remote>:/`. Top-level entries use this as
/// their `parent_path`.
pub fn remote_root(remote: &str) -> String {
    format!("{remote}:/")
}

/// Containing directory of a full remote path. Never crosses the remote
/// prefix separator, so `<remote>:/top` maps to the remote root.
pub fn parent_path_of(path: &str, remote: &str) -> String {
    let prefix_end = path.find(':').map(|i| i + 1).unwrap_or(0);
    match path.rfind('/') {
        Some(idx) if idx > prefix_end => path[..idx].to_string(),
        _ => remote_root(remote),
    }
}

/// Lowercased extension of a file name, without the dot. Names with no dot,
/// or starting with a dot, have no extension.
pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => name[idx + 1..].to_ascii_lowercase(),
    }
}

/// Current local time as an ISO-8601 seconds-precision stamp. Centralized so
/// every stored timestamp sorts consistently.
pub fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_rules() {
        assert_eq!(extension_of("report.PDF"), "pdf");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("trailing."), "");
    }

    #[test]
    fn parent_paths_stop_at_remote_prefix() {
        assert_eq!(parent_path_of("drive:/a/b/c.txt", "drive"), "drive:/a/b");
        assert_eq!(parent_path_of("drive:/top.txt", "drive"), "drive:/");
        assert_eq!(parent_path_of("drive:/", "drive"), "drive:/");
    }

    #[test]
    fn now_stamp_is_seconds_precision() {
        let stamp = now_stamp();
        assert_eq!(stamp.len(), 19);
        assert_eq!(stamp.as_bytes()[10], b'T');
    }
}
