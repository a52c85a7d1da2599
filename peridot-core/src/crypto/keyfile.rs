//! Machine-bound persistence of the database key.
//!
//! The 32-byte database key never touches disk in the clear: it is wrapped
//! with a key derived from the OS machine identifier and stored as
//! `salt(16) ‖ IV(12) ‖ wrapped_key ‖ tag(16)` with owner-only permissions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{IV_SIZE, KEY_SIZE, SALT_SIZE, TAG_SIZE, decrypt, derive_key, encrypt, generate_salt};
use crate::error::Result;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Stand-in identifier for systems without a readable machine id. Weaker
/// binding, but the index stays usable.
const FALLBACK_MACHINE_ID: &str = "peridot-drive-fallback";

fn machine_id() -> String {
    let id = fs::read_to_string(MACHINE_ID_PATH)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if id.is_empty() {
        FALLBACK_MACHINE_ID.to_string()
    } else {
        id
    }
}

/// Wrap `key` with the machine-derived key and write it to `path`.
pub fn store_wrapped_key(path: &Path, key: &[u8; KEY_SIZE]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let salt = generate_salt();
    let wrapping = derive_key(&machine_id(), &salt);
    let wrapped = encrypt(key, &wrapping)?;

    let mut contents = Vec::with_capacity(SALT_SIZE + wrapped.len());
    contents.extend_from_slice(&salt);
    contents.extend_from_slice(&wrapped);
    fs::write(path, &contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    info!("database key stored at {}", path.display());
    Ok(())
}

/// Load and unwrap the stored key. Returns `None` when the keyfile is absent,
/// truncated, or no longer unwraps (changed machine id); callers generate a
/// fresh key in all of those cases.
pub fn load_wrapped_key(path: &Path) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(_) => {
            debug!("no keyfile at {}, a new key will be generated", path.display());
            return None;
        }
    };

    if contents.len() < SALT_SIZE + IV_SIZE + TAG_SIZE {
        warn!("keyfile {} is truncated ({} bytes)", path.display(), contents.len());
        return None;
    }

    let (salt, wrapped) = contents.split_at(SALT_SIZE);
    let wrapping = derive_key(&machine_id(), salt);
    match decrypt(wrapped, &wrapping) {
        Ok(key_bytes) if key_bytes.len() == KEY_SIZE => {
            let mut key = Zeroizing::new([0u8; KEY_SIZE]);
            key.copy_from_slice(&key_bytes);
            Some(key)
        }
        Ok(_) => {
            warn!("keyfile {} unwrapped to an unexpected length", path.display());
            None
        }
        Err(_) => {
            warn!(
                "failed to unwrap keyfile {} (machine id may have changed)",
                path.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(".keyfile");
        let key = generate_key();

        store_wrapped_key(&path, &key).unwrap();
        let loaded = load_wrapped_key(&path).expect("key should unwrap on same machine");
        assert_eq!(*loaded, *key);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_keyfile_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_wrapped_key(&dir.path().join("nope")).is_none());
    }

    #[test]
    fn truncated_keyfile_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".keyfile");
        fs::write(&path, [0u8; SALT_SIZE + IV_SIZE]).unwrap();
        assert!(load_wrapped_key(&path).is_none());
    }

    #[test]
    fn corrupted_keyfile_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".keyfile");
        let key = generate_key();
        store_wrapped_key(&path, &key).unwrap();

        let mut contents = fs::read(&path).unwrap();
        let last = contents.len() - 1;
        contents[last] ^= 0xff;
        fs::write(&path, &contents).unwrap();

        assert!(load_wrapped_key(&path).is_none());
    }
}
