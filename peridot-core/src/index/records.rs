//! Streaming extraction of listing records from the lister's stdout.
//!
//! The lister emits one JSON array that can span millions of elements, so the
//! output is never parsed as a document. [`RecordSplitter`] walks raw bytes
//! with a brace-depth state machine and hands over one complete object at a
//! time; memory use is bounded by the largest single record. Field access is
//! a direct key scan rather than a general JSON parse, which is both faster
//! and keeps the bounded-memory property easy to reason about.

use crate::index::types::{IndexedEntry, extension_of, parent_path_of};

/// Splits a byte stream into complete `{...}` objects. Brace characters
/// inside strings (including escaped quotes) do not affect the depth.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    depth: u32,
    in_string: bool,
    escape_next: bool,
    current: Vec<u8>,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self {
            current: Vec::with_capacity(2048),
            ..Self::default()
        }
    }

    /// Consume a chunk, invoking `emit` once per completed object. Chunk
    /// boundaries may fall anywhere, including inside escapes.
    pub fn feed<F: FnMut(&str)>(&mut self, chunk: &[u8], mut emit: F) {
        for &byte in chunk {
            if self.escape_next {
                self.escape_next = false;
                if self.depth > 0 {
                    self.current.push(byte);
                }
                continue;
            }

            if byte == b'\\' && self.in_string {
                self.escape_next = true;
                if self.depth > 0 {
                    self.current.push(byte);
                }
                continue;
            }

            if byte == b'"' {
                self.in_string = !self.in_string;
            }

            if !self.in_string {
                if byte == b'{' {
                    if self.depth == 0 {
                        self.current.clear();
                    }
                    self.depth += 1;
                } else if byte == b'}' && self.depth > 0 {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.current.push(byte);
                        emit(&String::from_utf8_lossy(&self.current));
                        self.current.clear();
                        continue;
                    }
                }
            }

            if self.depth > 0 {
                self.current.push(byte);
            }
        }
    }
}

/// One element of the lister output, before composition into an index entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteRecord {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub mod_time: String,
    pub is_dir: bool,
}

/// Extract the fields we index from one record. Records without a path or
/// name are dropped. Unknown keys and whitespace are ignored.
pub fn parse_record(object: &str) -> Option<RemoteRecord> {
    let path = scan_string(object, "Path")?;
    let name = scan_string(object, "Name")?;
    if path.is_empty() || name.is_empty() {
        return None;
    }

    let mod_time = scan_string(object, "ModTime")
        .map(|t| truncate_to_seconds(&t))
        .unwrap_or_default();

    Some(RemoteRecord {
        path,
        name,
        size: scan_i64(object, "Size").unwrap_or(-1),
        mod_time,
        is_dir: scan_bool(object, "IsDir"),
    })
}

impl RemoteRecord {
    /// Compose the full index entry for a record under `remote`.
    pub fn into_entry(self, remote: &str) -> IndexedEntry {
        let path = format!("{remote}:/{}", self.path);
        let parent_path = parent_path_of(&path, remote);
        let extension = if self.is_dir { String::new() } else { extension_of(&self.name) };
        IndexedEntry {
            id: 0,
            extension,
            parent_path,
            path,
            size: if self.is_dir { 0 } else { self.size },
            mod_time: self.mod_time,
            is_directory: self.is_dir,
            is_synced: false,
            local_path: String::new(),
            name: self.name,
            relevance: 0.0,
        }
    }
}

/// Drop sub-second precision so stored stamps stay lexicographically
/// comparable: `2024-01-02T03:04:05` is exactly 19 characters.
fn truncate_to_seconds(stamp: &str) -> String {
    stamp.get(..19).unwrap_or(stamp).to_string()
}

fn value_start<'a>(object: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\":");
    let pos = object.find(&needle)? + needle.len();
    Some(object[pos..].trim_start_matches([' ', '\t']))
}

/// Scan for a string value, decoding the escapes the lister emits.
pub fn scan_string(object: &str, key: &str) -> Option<String> {
    let rest = value_start(object, key)?;
    let mut chars = rest.chars();
    if chars.next() != Some('"') {
        return None;
    }

    let mut out = String::with_capacity(64);
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
    None
}

pub fn scan_i64(object: &str, key: &str) -> Option<i64> {
    let rest = value_start(object, key)?;
    let end = rest
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    rest[..end].parse().ok()
}

pub fn scan_bool(object: &str, key: &str) -> bool {
    value_start(object, key).is_some_and(|rest| rest.starts_with("true"))
}
