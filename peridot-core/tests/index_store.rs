//! End-to-end tests of the encrypted index store against real files.

use std::fs;

use peridot_core::config::EngineConfig;
use peridot_core::crypto;
use peridot_core::index::types::{extension_of, parent_path_of, remote_root};
use peridot_core::{FileIndex, IndexedEntry};
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> EngineConfig {
    EngineConfig::with_base_dirs(tmp.path().join("cache"), tmp.path().join("data"))
}

fn entry(path: &str, is_directory: bool, size: i64, mod_time: &str) -> IndexedEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    IndexedEntry {
        extension: if is_directory { String::new() } else { extension_of(&name) },
        parent_path: parent_path_of(path, "drive"),
        path: path.to_string(),
        size: if is_directory { 0 } else { size },
        mod_time: mod_time.to_string(),
        is_directory,
        name,
        ..IndexedEntry::default()
    }
}

#[test]
fn first_run_bootstrap_creates_everything() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let index = FileIndex::new(&config).unwrap();

    index.initialize().unwrap();

    assert!(config.db_path().unwrap().exists());
    assert!(config.keyfile_path().unwrap().exists());

    let stats = index.stats();
    assert_eq!(stats.total_files, 0);
    assert_eq!(stats.total_folders, 0);
    assert_eq!(stats.total_size_bytes, 0);
    assert!(stats.last_full_index.is_empty());

    // Initialize is idempotent on an open store.
    index.initialize().unwrap();

    index.shutdown();
    let on_disk = fs::read(config.db_path().unwrap()).unwrap();
    assert_eq!(&on_disk[..8], crypto::MAGIC);
}

#[test]
fn reopens_encrypted_database_with_contents() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    {
        let index = FileIndex::new(&config).unwrap();
        index.initialize().unwrap();
        index
            .insert_files_batch(&[entry("drive:/hello.txt", false, 5, "2024-01-01T00:00:00")])
            .unwrap();
        index.shutdown();
    }

    let index = FileIndex::new(&config).unwrap();
    index.initialize().unwrap();
    let stats = index.stats();
    assert_eq!(stats.total_files, 1);
    let found = index.search("hello", 10, false);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].path, "drive:/hello.txt");
    index.shutdown();
}

#[test]
fn corrupted_database_is_moved_aside() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    {
        let index = FileIndex::new(&config).unwrap();
        index.initialize().unwrap();
        index
            .insert_files_batch(&[entry("drive:/x.txt", false, 1, "2024-01-01T00:00:00")])
            .unwrap();
        index.shutdown();
    }

    // Flip a byte in the authentication tag region.
    let db_path = config.db_path().unwrap();
    let mut contents = fs::read(&db_path).unwrap();
    let last = contents.len() - 1;
    contents[last] ^= 0x55;
    fs::write(&db_path, &contents).unwrap();

    let index = FileIndex::new(&config).unwrap();
    index.initialize().unwrap();
    assert_eq!(index.stats().total_files, 0);

    let aside: Vec<_> = fs::read_dir(db_path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".corrupted."))
        .collect();
    assert_eq!(aside.len(), 1);
    index.shutdown();
}

#[test]
fn search_prefix_and_extension_case() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[
            entry("drive:/a.txt", false, 10, "2024-01-01T00:00:00"),
            entry("drive:/b.TXT", false, 10, "2024-01-02T00:00:00"),
            entry("drive:/notes", true, 0, "2024-01-01T00:00:00"),
            entry("drive:/notes/a.md", false, 20, "2024-01-03T00:00:00"),
        ])
        .unwrap();

    let txt = index.search_with_filters("", "txt", "", false, false, 0);
    assert_eq!(
        txt.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
        vec!["drive:/a.txt", "drive:/b.TXT"],
        "extension filter is case-insensitive and ordered by name"
    );

    let hits = index.search("a", 10, false);
    let paths: Vec<_> = hits.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"drive:/a.txt"));
    assert!(paths.contains(&"drive:/notes/a.md"));
    assert!(!paths.contains(&"drive:/b.TXT"));

    // Folders are excluded unless asked for.
    let with_folders = index.search("notes", 10, true);
    assert!(with_folders.iter().any(|e| e.is_directory));
    let without = index.search("notes", 10, false);
    assert!(without.iter().all(|e| !e.is_directory));

    index.shutdown();
}

#[test]
fn filter_combinations() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[
            entry("drive:/docs", true, 0, "2024-01-01T00:00:00"),
            entry("drive:/docs/report.pdf", false, 100, "2024-02-01T00:00:00"),
            entry("drive:/docs/notes.txt", false, 50, "2024-02-02T00:00:00"),
            entry("drive:/music/song.mp3", false, 900, "2024-02-03T00:00:00"),
        ])
        .unwrap();
    index
        .update_sync_status("drive:/docs/report.pdf", true, "/home/u/docs/report.pdf")
        .unwrap();

    // Mutually exclusive flags yield nothing.
    assert!(index.search_with_filters("", "", "", true, true, 0).is_empty());

    let synced = index.search_with_filters("", "", "", true, false, 0);
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].local_path, "/home/u/docs/report.pdf");

    let cloud = index.search_with_filters("", "", "", false, true, 0);
    assert_eq!(cloud.len(), 3);

    let under_docs = index.search_with_filters("", "", "drive:/docs", false, false, 0);
    assert_eq!(under_docs.len(), 3);

    let csv = index.search_with_filters("", " PDF , mp3 ", "", false, false, 0);
    assert_eq!(csv.len(), 2);

    let limited = index.search_with_filters("", "", "", false, false, 2);
    assert_eq!(limited.len(), 2);

    index.shutdown();
}

#[test]
fn batch_upsert_is_visible_and_replaces_by_path() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    let batch: Vec<_> = (0..1000)
        .map(|i| entry(&format!("drive:/bulk/f{i:04}.dat"), false, i, "2024-03-01T00:00:00"))
        .collect();
    assert_eq!(index.insert_files_batch(&batch).unwrap(), 1000);
    assert_eq!(index.stats().total_files, 1000);

    // Upserting the same paths must not duplicate rows.
    assert_eq!(index.insert_files_batch(&batch).unwrap(), 1000);
    assert_eq!(index.stats().total_files, 1000);

    index.shutdown();
}

#[test]
fn directory_contents_orders_directories_first() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[
            entry("drive:/zeta.txt", false, 1, "2024-01-01T00:00:00"),
            entry("drive:/alpha", true, 0, "2024-01-01T00:00:00"),
            entry("drive:/beta.txt", false, 1, "2024-01-01T00:00:00"),
            entry("drive:/alpha/inner.txt", false, 1, "2024-01-01T00:00:00"),
        ])
        .unwrap();

    let top = index.get_directory_contents(&remote_root("drive"));
    let names: Vec<_> = top.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta.txt", "zeta.txt"]);
    assert!(top[0].is_directory);

    index.shutdown();
}

#[test]
fn recent_files_are_files_only_newest_first() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[
            entry("drive:/old.txt", false, 1, "2023-01-01T00:00:00"),
            entry("drive:/new.txt", false, 1, "2024-06-01T00:00:00"),
            entry("drive:/mid.txt", false, 1, "2024-01-01T00:00:00"),
            entry("drive:/newest-dir", true, 0, "2025-01-01T00:00:00"),
        ])
        .unwrap();

    let recent = index.get_recent_files(2);
    let names: Vec<_> = recent.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["new.txt", "mid.txt"]);

    index.shutdown();
}

#[test]
fn prune_removes_unseen_entries_and_descendants() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[
            entry("drive:/keep.txt", false, 1, "2024-01-01T00:00:00"),
            entry("drive:/gone", true, 0, "2024-01-01T00:00:00"),
            entry("drive:/gone/child.txt", false, 1, "2024-01-01T00:00:00"),
            entry("drive:/gone/sub", true, 0, "2024-01-01T00:00:00"),
            entry("drive:/gone/sub/deep.txt", false, 1, "2024-01-01T00:00:00"),
        ])
        .unwrap();

    let removed = index
        .prune_stale_entries(&remote_root("drive"), &["drive:/keep.txt".to_string()])
        .unwrap();
    assert_eq!(removed, 1);

    let stats = index.stats();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.total_folders, 0);
    assert!(!stats.last_partial_index.is_empty());

    // An empty seen-set is a guard against wiping the directory.
    let removed = index.prune_stale_entries(&remote_root("drive"), &[]).unwrap();
    assert_eq!(removed, 0);

    index.shutdown();
}

#[test]
fn clear_index_empties_everything() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();
    index.initialize().unwrap();

    index
        .insert_files_batch(&[entry("drive:/a.txt", false, 1, "2024-01-01T00:00:00")])
        .unwrap();
    index.clear_index().unwrap();

    assert_eq!(index.stats().total_files, 0);
    assert!(index.search("a", 10, true).is_empty());
    index.shutdown();
}

#[test]
fn queries_before_initialize_return_empty() {
    let tmp = TempDir::new().unwrap();
    let index = FileIndex::new(&test_config(&tmp)).unwrap();

    assert!(index.search("x", 10, true).is_empty());
    assert!(index.get_directory_contents("drive:/").is_empty());
    assert!(index.get_recent_files(5).is_empty());
    assert_eq!(index.stats().total_files, 0);

    // Shutdown before initialize is a harmless no-op.
    index.shutdown();
}

#[test]
fn db_file_permissions_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let index = FileIndex::new(&config).unwrap();
    index.initialize().unwrap();

    let mode = fs::metadata(config.db_path().unwrap()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    index.shutdown();
}
