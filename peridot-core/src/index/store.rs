//! Encrypted on-disk index of the remote file tree.
//!
//! The store owns a single SQLite handle in WAL mode. On disk between runs
//! the database file is AES-256-GCM encrypted (magic-prefixed); `initialize`
//! decrypts it in place and `shutdown` re-encrypts after a truncating WAL
//! checkpoint. A database that fails to decrypt is renamed aside and replaced
//! with a fresh one rather than aborting startup.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::crypto::{self, KEY_SIZE, keyfile};
use crate::error::{EngineError, Result};
use crate::index::types::{IndexStats, IndexedEntry, now_stamp};

const ENTRY_COLUMNS: &str =
    "id, name, path, parent_path, size, mod_time, is_directory, is_synced, local_path, extension";

struct StoreState {
    conn: Option<Connection>,
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

pub struct FileIndex {
    db_path: PathBuf,
    keyfile_path: PathBuf,
    state: Mutex<StoreState>,
    fts_enabled: AtomicBool,
}

impl std::fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIndex")
            .field("db_path", &self.db_path)
            .field("fts_enabled", &self.fts_enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileIndex {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            db_path: config.db_path()?,
            keyfile_path: config.keyfile_path()?,
            state: Mutex::new(StoreState { conn: None, key: None }),
            fts_enabled: AtomicBool::new(false),
        })
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Open (and if needed create) the index database. Idempotent: a second
    /// call on an open store is a no-op success.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().expect("index store lock poisoned");
        if state.conn.is_some() {
            return Ok(());
        }

        info!("initializing index database at {}", self.db_path.display());
        if let Some(dir) = self.db_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let key = match keyfile::load_wrapped_key(&self.keyfile_path) {
            Some(key) => {
                info!("loaded existing database key");
                key
            }
            None => {
                info!("generating new database key");
                let key = crypto::generate_key();
                keyfile::store_wrapped_key(&self.keyfile_path, &key)?;
                key
            }
        };

        if self.db_path.exists() && crypto::is_encrypted_file(&self.db_path) {
            if let Err(e) = crypto::decrypt_file(&self.db_path, &key) {
                let epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let aside = PathBuf::from(format!(
                    "{}.corrupted.{}",
                    self.db_path.display(),
                    epoch
                ));
                error!("failed to decrypt database ({e}), moving it to {}", aside.display());
                fs::rename(&self.db_path, &aside)?;
            }
        }

        let conn = Connection::open(&self.db_path)?;
        fs::set_permissions(&self.db_path, fs::Permissions::from_mode(0o600))?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let fts_ok = create_tables(&conn)?;
        self.fts_enabled.store(fts_ok, Ordering::Relaxed);

        state.key = Some(key);
        state.conn = Some(conn);
        drop(state);

        let stats = self.stats();
        info!(
            "loaded existing index: {} files, {} folders",
            stats.total_files, stats.total_folders
        );
        Ok(())
    }

    /// Checkpoint, close and encrypt the database. Idempotent; a crash that
    /// skips this leaves the file plaintext until the next clean shutdown.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.take() else {
            return;
        };

        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!("WAL checkpoint failed: {e}");
        }
        if let Err((_, e)) = conn.close() {
            warn!("closing index database failed: {e}");
        }
        info!("index database closed");

        if let Some(key) = state.key.take() {
            if self.db_path.exists() {
                match crypto::encrypt_file(&self.db_path, &key) {
                    Ok(()) => info!("index database encrypted"),
                    Err(e) => error!("failed to encrypt database, file remains plaintext: {e}"),
                }
            }
        }
    }

    /// Full-text search with a prefix-match token, falling back to substring
    /// matching when FTS is unavailable. `limit <= 0` means unlimited.
    pub fn search(&self, query: &str, limit: i64, include_folders: bool) -> Vec<IndexedEntry> {
        if query.is_empty() {
            return Vec::new();
        }
        let state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.as_ref() else {
            warn!("search called before initialize");
            return Vec::new();
        };

        if self.fts_enabled.load(Ordering::Relaxed) {
            match fts_search(conn, query, limit, include_folders) {
                Ok(rows) => return rows,
                Err(e) => debug!("FTS search unavailable ({e}), using substring search"),
            }
        }
        match like_search(conn, query, limit, include_folders) {
            Ok(rows) => rows,
            Err(e) => {
                error!("search failed: {e}");
                Vec::new()
            }
        }
    }

    /// Conjunctive filtered search ordered by name. `synced_only` and
    /// `cloud_only` together yield the empty set.
    pub fn search_with_filters(
        &self,
        query: &str,
        extension_csv: &str,
        path_prefix: &str,
        synced_only: bool,
        cloud_only: bool,
        limit: i64,
    ) -> Vec<IndexedEntry> {
        let state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.as_ref() else {
            warn!("search_with_filters called before initialize");
            return Vec::new();
        };

        let mut sql = format!("SELECT {ENTRY_COLUMNS}, 0.0 AS relevance FROM files WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if !query.is_empty() {
            sql.push_str(" AND (name LIKE ? OR path LIKE ?)");
            let pattern = format!("%{query}%");
            args.push(pattern.clone());
            args.push(pattern);
        }

        let extensions: Vec<String> = extension_csv
            .split(',')
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if !extensions.is_empty() {
            sql.push_str(" AND extension IN (");
            for (i, ext) in extensions.into_iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                args.push(ext);
            }
            sql.push(')');
        }

        if !path_prefix.is_empty() {
            sql.push_str(" AND path LIKE ?");
            args.push(format!("{path_prefix}%"));
        }
        if synced_only {
            sql.push_str(" AND is_synced = 1");
        }
        if cloud_only {
            sql.push_str(" AND is_synced = 0");
        }

        sql.push_str(" ORDER BY name");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        match query_entries(conn, &sql, &args) {
            Ok(rows) => rows,
            Err(e) => {
                error!("filtered search failed: {e}");
                Vec::new()
            }
        }
    }

    /// Children of a directory, directories first, then by name.
    pub fn get_directory_contents(&self, path: &str) -> Vec<IndexedEntry> {
        let state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.as_ref() else {
            return Vec::new();
        };
        let sql = format!(
            "SELECT {ENTRY_COLUMNS}, 0.0 AS relevance FROM files \
             WHERE parent_path = ? ORDER BY is_directory DESC, name ASC"
        );
        match query_entries(conn, &sql, &[path.to_string()]) {
            Ok(rows) => rows,
            Err(e) => {
                error!("directory listing failed for {path}: {e}");
                Vec::new()
            }
        }
    }

    /// Most recently modified files (never directories).
    pub fn get_recent_files(&self, limit: i64) -> Vec<IndexedEntry> {
        let state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.as_ref() else {
            return Vec::new();
        };
        let sql = format!(
            "SELECT {ENTRY_COLUMNS}, 0.0 AS relevance FROM files \
             WHERE is_directory = 0 ORDER BY mod_time DESC LIMIT ?"
        );
        let effective = if limit > 0 { limit } else { -1 };
        let result = conn
            .prepare(&sql)
            .and_then(|mut stmt| {
                let rows = stmt.query_map([effective], entry_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            });
        match result {
            Ok(rows) => rows,
            Err(e) => {
                error!("recent files query failed: {e}");
                Vec::new()
            }
        }
    }

    /// Upsert a batch of entries in one transaction. Individual row failures
    /// are logged and skipped; the batch still commits. Returns the number of
    /// rows written, or an error if the transaction itself failed.
    pub fn insert_files_batch(&self, entries: &[IndexedEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_mut().ok_or(EngineError::NotInitialized)?;

        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        let mut errors = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO files \
                 (name, path, parent_path, size, mod_time, is_directory, is_synced, local_path, extension, indexed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let stamp = now_stamp();
            for entry in entries {
                let outcome = stmt.execute(params![
                    entry.name,
                    entry.path,
                    entry.parent_path,
                    entry.size,
                    entry.mod_time,
                    entry.is_directory,
                    entry.is_synced,
                    entry.local_path,
                    entry.extension,
                    stamp,
                ]);
                match outcome {
                    Ok(_) => inserted += 1,
                    Err(e) => {
                        errors += 1;
                        if errors <= 3 {
                            warn!("insert failed for {}: {e}", entry.path);
                        }
                    }
                }
            }
        }
        tx.commit()?;

        debug!("batch insert complete: {inserted} written, {errors} errors");
        Ok(inserted)
    }

    /// Flip the synced flag and local path of a single entry.
    pub fn update_sync_status(&self, remote_path: &str, is_synced: bool, local_path: &str) -> Result<()> {
        let state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_ref().ok_or(EngineError::NotInitialized)?;
        conn.execute(
            "UPDATE files SET is_synced = ?1, local_path = ?2 WHERE path = ?3",
            params![is_synced, local_path, remote_path],
        )?;
        Ok(())
    }

    /// Within one directory, delete every entry whose path was not seen in
    /// the latest listing, together with all of its descendants. Stamps the
    /// partial-index time when anything was removed.
    pub fn prune_stale_entries(&self, parent_path: &str, paths_seen: &[String]) -> Result<usize> {
        if paths_seen.is_empty() {
            return Ok(0);
        }
        let existing = self.get_directory_contents(parent_path);

        let state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_ref().ok_or(EngineError::NotInitialized)?;

        let mut removed = 0usize;
        for entry in existing {
            if paths_seen.iter().any(|seen| *seen == entry.path) {
                continue;
            }
            conn.execute(
                "DELETE FROM files WHERE path = ?1 OR path LIKE ?2",
                params![entry.path, format!("{}/%", entry.path)],
            )?;
            removed += 1;
        }

        if removed > 0 {
            set_meta(conn, "last_partial_index", &now_stamp())?;
            info!("pruned {removed} stale entries under {parent_path}");
        }
        Ok(removed)
    }

    /// Delete every entry and clear the full-index stamp.
    pub fn clear_index(&self) -> Result<()> {
        let state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_ref().ok_or(EngineError::NotInitialized)?;
        conn.execute("DELETE FROM files", [])?;
        conn.execute(
            "UPDATE index_meta SET value = '' WHERE key = 'last_full_index'",
            [],
        )?;
        info!("index cleared");
        Ok(())
    }

    /// Live counts and stamps. Indexer progress is overlaid by the engine.
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        let state = self.state.lock().expect("index store lock poisoned");
        let Some(conn) = state.conn.as_ref() else {
            return stats;
        };

        let counts = conn.query_row(
            "SELECT \
               COALESCE(SUM(CASE WHEN is_directory = 0 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN is_directory = 1 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN is_directory = 0 THEN size ELSE 0 END), 0) \
             FROM files",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        );
        if let Ok((files, folders, bytes)) = counts {
            stats.total_files = files;
            stats.total_folders = folders;
            stats.total_size_bytes = bytes;
        }

        stats.last_full_index = get_meta(conn, "last_full_index").unwrap_or_default();
        stats.last_partial_index = get_meta(conn, "last_partial_index").unwrap_or_default();
        stats.status = "Idle".to_string();
        stats
    }

    /// Drop all entries without touching the index stamps. The full
    /// re-index path empties the table before streaming fresh data in.
    pub(crate) fn delete_all_entries(&self) -> Result<()> {
        let state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_ref().ok_or(EngineError::NotInitialized)?;
        conn.execute("DELETE FROM files", [])?;
        Ok(())
    }

    /// Record the completion time of a full index run.
    pub(crate) fn mark_full_index_complete(&self) -> Result<()> {
        let state = self.state.lock().expect("index store lock poisoned");
        let conn = state.conn.as_ref().ok_or(EngineError::NotInitialized)?;
        let stamp = now_stamp();
        set_meta(conn, "last_full_index", &stamp)?;
        info!("full index completed at {stamp}");
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().expect("index store lock poisoned").conn.is_some()
    }
}

fn create_tables(conn: &Connection) -> Result<bool> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            path TEXT NOT NULL UNIQUE,
            parent_path TEXT,
            size INTEGER DEFAULT -1,
            mod_time TEXT,
            is_directory INTEGER DEFAULT 0,
            is_synced INTEGER DEFAULT 0,
            local_path TEXT,
            extension TEXT,
            indexed_at TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_path);
         CREATE INDEX IF NOT EXISTS idx_files_extension ON files(extension);
         CREATE INDEX IF NOT EXISTS idx_files_synced ON files(is_synced);
         CREATE INDEX IF NOT EXISTS idx_files_name ON files(name);",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT
         );
         INSERT OR IGNORE INTO index_meta (key, value) VALUES ('last_full_index', '');
         INSERT OR IGNORE INTO index_meta (key, value) VALUES ('last_partial_index', '');",
    )?;

    // FTS5 is compiled into the bundled SQLite but may be missing from a
    // system library; base search still works without it.
    let fts = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
            name,
            path,
            extension,
            content='files',
            content_rowid='id',
            tokenize='porter unicode61'
         );
         CREATE TRIGGER IF NOT EXISTS files_ai AFTER INSERT ON files BEGIN
            INSERT INTO files_fts(rowid, name, path, extension)
            VALUES (new.id, new.name, new.path, new.extension);
         END;
         CREATE TRIGGER IF NOT EXISTS files_ad AFTER DELETE ON files BEGIN
            INSERT INTO files_fts(files_fts, rowid, name, path, extension)
            VALUES ('delete', old.id, old.name, old.path, old.extension);
         END;
         CREATE TRIGGER IF NOT EXISTS files_au AFTER UPDATE ON files BEGIN
            INSERT INTO files_fts(files_fts, rowid, name, path, extension)
            VALUES ('delete', old.id, old.name, old.path, old.extension);
            INSERT INTO files_fts(rowid, name, path, extension)
            VALUES (new.id, new.name, new.path, new.extension);
         END;",
    );
    match fts {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!("full-text index unavailable, falling back to substring search: {e}");
            Ok(false)
        }
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexedEntry> {
    Ok(IndexedEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        parent_path: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        size: row.get(4)?,
        mod_time: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        is_directory: row.get(6)?,
        is_synced: row.get(7)?,
        local_path: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        extension: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        relevance: row.get(10)?,
    })
}

fn query_entries(conn: &Connection, sql: &str, args: &[String]) -> rusqlite::Result<Vec<IndexedEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), entry_from_row)?;
    rows.collect()
}

/// Quote the query as a single FTS5 prefix token. Embedded quotes are doubled
/// and `*` stripped so user input cannot change the match syntax.
fn fts_prefix_token(query: &str) -> String {
    let cleaned: String = query.chars().filter(|c| *c != '*').collect();
    format!("\"{}\"*", cleaned.replace('"', "\"\""))
}

fn fts_search(
    conn: &Connection,
    query: &str,
    limit: i64,
    include_folders: bool,
) -> rusqlite::Result<Vec<IndexedEntry>> {
    let mut sql = format!(
        "SELECT f.id, f.name, f.path, f.parent_path, f.size, f.mod_time, \
                f.is_directory, f.is_synced, f.local_path, f.extension, \
                bm25(files_fts) AS relevance \
         FROM files_fts \
         JOIN files f ON files_fts.rowid = f.id \
         WHERE files_fts MATCH ?"
    );
    if !include_folders {
        sql.push_str(" AND f.is_directory = 0");
    }
    sql.push_str(" ORDER BY relevance");
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    query_entries(conn, &sql, &[fts_prefix_token(query)])
}

fn like_search(
    conn: &Connection,
    query: &str,
    limit: i64,
    include_folders: bool,
) -> rusqlite::Result<Vec<IndexedEntry>> {
    let mut sql = format!(
        "SELECT {ENTRY_COLUMNS}, 0.0 AS relevance FROM files \
         WHERE (name LIKE ?1 OR path LIKE ?1)"
    );
    if !include_folders {
        sql.push_str(" AND is_directory = 0");
    }
    sql.push_str(" ORDER BY name");
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    query_entries(conn, &sql, &[format!("%{query}%")])
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM index_meta WHERE key = ?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .filter(|v| !v.is_empty())
}
