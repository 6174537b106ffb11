//! Passphrase keyed authenticated encryption for cache blobs.
//!
//! Keys are `SHA-256(seed || salt)`. Blobs are sealed with ChaCha20-Poly1305 and carry their own
//! random nonce as a 12 byte prefix. A [`KeyId`] is the base64 of `SHA-256(key)`; it labels the
//! bucket a blob lives in without revealing the key or the passphrase behind it.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as CipherKey, Nonce};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a derived key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of the random nonce prefixed to every sealed blob.
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from key derivation and blob sealing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    /// The key seed was empty.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Wrong key, or the ciphertext was tampered with or truncated.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The cipher refused to seal the payload.
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Symmetric cache key. Never printed.
pub struct Key(Secret<[u8; KEY_LEN]>);

impl Key {
    fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Secret::new(bytes))
    }

    fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key([REDACTED])")
    }
}

/// Non-secret bucket label derived from a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// The base64 label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for KeyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic salted derivation; the same seed and salt always give the same key.
pub fn derive_key(seed: &[u8], salt: &[u8]) -> Result<Key, VaultError> {
    if seed.is_empty() {
        return Err(VaultError::InvalidInput("key seed must not be empty"));
    }

    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(salt);
    let digest = hasher.finalize();

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&digest);

    Ok(Key::from_bytes(bytes))
}

/// Bucket label for `key`: the base64 SHA-256 digest of the key bytes.
pub fn key_id(key: &Key) -> KeyId {
    KeyId(base64::encode(Sha256::digest(key.expose())))
}

/// Seals `plaintext`. The output is `nonce || ciphertext || tag`.
pub fn encrypt(key: &Key, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key.expose()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(sealed)
}

/// Opens a blob produced by [`encrypt`].
pub fn decrypt(key: &Key, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::AuthenticationFailed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key.expose()));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::AuthenticationFailed)
}
