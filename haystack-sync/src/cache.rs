//! Encrypted multi-holder resume cache.
//!
//! One container holds blobs for any number of passphrases. Each blob is a sealed
//! `{"blob": true, "data": <record>}` envelope, bucketed under the [`KeyId`] of the key derived
//! from its passphrase and the container salt. On disk the container is flat JSON:
//!
//! ```json
//! {"version": "sc2", "salt": "<base64>", "blobs": {"<key id>": ["<base64 ciphertext>"]}}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretVec};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::primitives::{BlockSummary, GlobalIndex, Transaction};
use crate::vault::{self, KeyId, VaultError};

/// Container format tag. Compared for exact equality on load.
pub const CACHE_VERSION: &str = "sc2";
/// Length of the per-container salt mixed into every key derivation.
pub const SALT_LEN: usize = 32;

/// Errors loading, saving or keying a cache container.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Container was written by an incompatible version.
    #[error("unsupported cache version {found:?}, expected {expected:?}")]
    UnsupportedVersion {
        /// Version tag found in the file
        found: String,
        /// Version tag this build reads
        expected: &'static str,
    },
    /// Required field missing or malformed.
    #[error("malformed cache container. {0}")]
    Format(String),
    /// Key derivation failed, for example on an empty passphrase.
    #[error("vault error. {0}")]
    Vault(#[from] VaultError),
    /// Container or record JSON could not be encoded or decoded.
    #[error("serialization error. {0}")]
    Serialization(#[from] serde_json::Error),
    /// Reading or writing the container file failed.
    #[error("io error. {0}")]
    Io(#[from] std::io::Error),
}

/// Full scan state for one holder, stored as a single encrypted blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Matched transactions keyed by the owned slot's global index
    pub txs_by_global_index: BTreeMap<GlobalIndex, Vec<Transaction>>,
    /// Chain window at the end of the run, oldest first
    pub scanned_blocks: Vec<BlockSummary>,
}

#[derive(Serialize, Deserialize)]
struct BlobEnvelope<T> {
    blob: bool,
    data: T,
}

#[derive(Serialize)]
struct ContainerFileOut<'a> {
    version: &'a str,
    salt: String,
    blobs: &'a BTreeMap<KeyId, Vec<String>>,
}

#[derive(Deserialize)]
struct ContainerFileIn {
    version: Option<String>,
    salt: Option<String>,
    blobs: Option<BTreeMap<KeyId, Vec<String>>>,
}

/// In-memory cache container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContainer {
    salt: [u8; SALT_LEN],
    blobs: BTreeMap<KeyId, Vec<String>>,
}

impl Default for CacheContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheContainer {
    /// Empty container with a fresh random salt.
    pub fn new() -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        Self {
            salt,
            blobs: BTreeMap::new(),
        }
    }

    /// Salt shared by every bucket in this container.
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Number of blobs across all buckets.
    pub fn blob_count(&self) -> usize {
        self.blobs.values().map(Vec::len).sum()
    }

    /// Number of distinct key buckets.
    pub fn bucket_count(&self) -> usize {
        self.blobs.len()
    }

    fn key_for(&self, passphrase: &[u8]) -> Result<(vault::Key, KeyId), CacheError> {
        let key = vault::derive_key(passphrase, &self.salt)?;
        let id = vault::key_id(&key);

        Ok((key, id))
    }

    fn add_obj<T: Serialize>(&mut self, passphrase: &[u8], obj: &T) -> Result<(), CacheError> {
        let (key, id) = self.key_for(passphrase)?;
        let plaintext = serde_json::to_vec(&BlobEnvelope {
            blob: true,
            data: obj,
        })?;
        let sealed = vault::encrypt(&key, &plaintext)?;
        self.blobs
            .entry(id)
            .or_default()
            .push(base64::encode(sealed));

        Ok(())
    }

    fn get_objs<T: DeserializeOwned>(&self, passphrase: &[u8]) -> Result<Vec<T>, CacheError> {
        let (key, id) = self.key_for(passphrase)?;
        let Some(blobs) = self.blobs.get(&id) else {
            return Ok(Vec::new());
        };

        let mut objs = Vec::with_capacity(blobs.len());
        for (position, blob) in blobs.iter().enumerate() {
            let Ok(sealed) = base64::decode(blob) else {
                tracing::debug!("skipping cache blob {}: not base64", position);
                continue;
            };
            let Ok(plaintext) = vault::decrypt(&key, &sealed) else {
                tracing::debug!("skipping cache blob {}: authentication failed", position);
                continue;
            };
            match serde_json::from_slice::<BlobEnvelope<T>>(&plaintext) {
                Ok(envelope) if envelope.blob => objs.push(envelope.data),
                Ok(_) => tracing::debug!("skipping cache blob {}: not a blob envelope", position),
                Err(e) => tracing::debug!("skipping cache blob {}: {}", position, e),
            }
        }

        Ok(objs)
    }

    /// Appends `record` under the passphrase's bucket. Existing blobs are kept, call
    /// [`Self::clear`] first to replace them.
    pub fn add(&mut self, passphrase: &[u8], record: &CacheRecord) -> Result<(), CacheError> {
        self.add_obj(passphrase, record)
    }

    /// Every record in the passphrase's bucket that decrypts and parses. Anything else in the
    /// bucket is skipped.
    pub fn get_all(&self, passphrase: &[u8]) -> Result<Vec<CacheRecord>, CacheError> {
        self.get_objs(passphrase)
    }

    /// Drops the passphrase's bucket.
    pub fn clear(&mut self, passphrase: &[u8]) -> Result<(), CacheError> {
        let (_, id) = self.key_for(passphrase)?;
        self.blobs.remove(&id);

        Ok(())
    }

    /// [`Self::get_all`] followed by [`Self::clear`].
    pub fn pop_all(&mut self, passphrase: &[u8]) -> Result<Vec<CacheRecord>, CacheError> {
        let records = self.get_all(passphrase)?;
        self.clear(passphrase)?;

        Ok(records)
    }

    /// Serializes the container to its JSON file format.
    pub fn save(&self) -> Result<Vec<u8>, CacheError> {
        let file = ContainerFileOut {
            version: CACHE_VERSION,
            salt: base64::encode(self.salt),
            blobs: &self.blobs,
        };

        Ok(serde_json::to_vec(&file)?)
    }

    /// Parses a container. The version tag is checked before anything else.
    pub fn load(bytes: &[u8]) -> Result<Self, CacheError> {
        let file: ContainerFileIn = serde_json::from_slice(bytes)?;

        let version = file
            .version
            .ok_or_else(|| CacheError::Format("missing field `version`".to_string()))?;
        if version != CACHE_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: version,
                expected: CACHE_VERSION,
            });
        }

        let salt = file
            .salt
            .ok_or_else(|| CacheError::Format("missing field `salt`".to_string()))?;
        let salt = base64::decode(salt)
            .map_err(|e| CacheError::Format(format!("salt is not base64: {e}")))?;
        let salt: [u8; SALT_LEN] = salt.try_into().map_err(|salt: Vec<u8>| {
            CacheError::Format(format!("salt must be {SALT_LEN} bytes, found {}", salt.len()))
        })?;

        let blobs = file
            .blobs
            .ok_or_else(|| CacheError::Format("missing field `blobs`".to_string()))?;

        Ok(Self { salt, blobs })
    }

    /// Reads and parses a container file.
    pub fn read_from_path(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path)?;
        Self::load(&bytes)
    }

    /// Writes the container through a temporary file in the same directory, then renames it
    /// over `path`.
    pub fn write_to_path(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, self.save()?)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }
}

/// A loaded container together with the passphrase that unlocks this holder's bucket.
pub struct CacheHandle {
    container: CacheContainer,
    passphrase: SecretVec<u8>,
}

impl CacheHandle {
    /// Pairs `container` with the passphrase of the holder being scanned.
    pub fn new(container: CacheContainer, passphrase: Vec<u8>) -> Self {
        Self {
            container,
            passphrase: SecretVec::new(passphrase),
        }
    }

    /// The wrapped container.
    pub fn container(&self) -> &CacheContainer {
        &self.container
    }

    pub(crate) fn passphrase(&self) -> &[u8] {
        self.passphrase.expose_secret()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut CacheContainer, &[u8]) {
        (&mut self.container, self.passphrase.expose_secret())
    }

    /// Drops the passphrase and returns the container, for example to write it to disk.
    pub fn into_container(self) -> CacheContainer {
        self.container
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("container", &self.container)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}
