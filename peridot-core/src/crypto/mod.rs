//! Authenticated encryption for the index database and keyfile.
//!
//! Everything at rest is AES-256-GCM: `IV(12) ‖ ciphertext ‖ tag(16)`, with
//! whole files carrying an 8-byte magic prefix so partially written or foreign
//! files are never mistaken for encrypted ones. Keys are derived with
//! PBKDF2-HMAC-SHA-256.

pub mod keyfile;

use std::fs;
use std::io::Read;
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, rand_core::RngCore},
};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::error::{EngineError, Result};

/// Marker prefix on encrypted files.
pub const MAGIC: &[u8; 8] = b"PDCRYPT1";
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

/// PBKDF2 rounds for key derivation.
const PBKDF2_ROUNDS: u32 = 100_000;

/// Derive a 256-bit key from a passphrase and salt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, key.as_mut());
    key
}

/// Cryptographically random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Cryptographically random 256-bit key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Encrypt `plaintext`, returning `IV ‖ ciphertext ‖ tag`. A fresh random IV
/// is drawn per call.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EngineError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`]. Fails if the blob is shorter than
/// `IV + tag` or the authentication tag rejects.
pub fn decrypt(blob: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    if blob.len() < IV_SIZE + TAG_SIZE {
        return Err(EngineError::Crypto(format!(
            "ciphertext too short ({} bytes)",
            blob.len()
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&blob[..IV_SIZE]);
    cipher
        .decrypt(nonce, &blob[IV_SIZE..])
        .map_err(|_| EngineError::Crypto("authentication failed".into()))
}

/// True when the file starts with the encryption magic.
pub fn is_encrypted_file(path: &Path) -> bool {
    let mut header = [0u8; MAGIC.len()];
    match fs::File::open(path) {
        Ok(mut file) => matches!(file.read_exact(&mut header), Ok(())) && &header == MAGIC,
        Err(_) => false,
    }
}

/// Encrypt a file in place: write `MAGIC ‖ blob` to a temp file in the same
/// directory, then atomically replace the original. On any failure the
/// original is left untouched.
pub fn encrypt_file(path: &Path, key: &[u8; KEY_SIZE]) -> Result<()> {
    let plaintext = fs::read(path)?;
    let blob = encrypt(&plaintext, key)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, MAGIC)?;
    std::io::Write::write_all(&mut tmp, &blob)?;
    tmp.persist(path)
        .map_err(|e| EngineError::Crypto(format!("failed to replace {}: {}", path.display(), e.error)))?;

    info!("encrypted {}", path.display());
    Ok(())
}

/// Decrypt a file in place. A file without the magic prefix is left as-is and
/// reported as success.
pub fn decrypt_file(path: &Path, key: &[u8; KEY_SIZE]) -> Result<()> {
    if !is_encrypted_file(path) {
        debug!("{} is not encrypted, nothing to do", path.display());
        return Ok(());
    }

    let contents = fs::read(path)?;
    let plaintext = decrypt(&contents[MAGIC.len()..], key).map_err(|e| {
        error!("failed to decrypt {}: {}", path.display(), e);
        e
    })?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, &plaintext)?;
    tmp.persist(path)
        .map_err(|e| EngineError::Crypto(format!("failed to replace {}: {}", path.display(), e.error)))?;

    info!("decrypted {}", path.display());
    Ok(())
}
