//! Encrypted key-value vaults backing the registry and cursor.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use fs4::FileExt;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::crypto::NONCE_LENGTH;
use crate::error::StorageError;

const VAULT_HKDF_SALT: &[u8] = b"tonlink-vault";
const VAULT_HKDF_INFO: &[u8] = b"tonlink/vault/v1";
const RECORD_EXTENSION: &str = "rec";
const LOCK_FILE: &str = ".lock";

/// Opaque persisted storage. Values are encrypted at rest by the implementation.
#[async_trait]
pub trait Vault: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local vault.
#[derive(Debug, Default)]
pub struct MemoryVault {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

/// One AES-256-GCM encrypted file per record. Writers serialize on an
/// advisory lock file in the vault directory.
pub struct FileVault {
    dir: PathBuf,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FileVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileVault")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileVault {
    pub fn new(dir: impl Into<PathBuf>, master_key: &SecretString) -> Result<Self, StorageError> {
        let dir = dir.into();
        if master_key.expose_secret().is_empty() {
            return Err(StorageError::IoFailure {
                key: dir.display().to_string(),
                reason: "vault master key is empty".to_string(),
            });
        }

        let hk = Hkdf::<Sha256>::new(Some(VAULT_HKDF_SALT), master_key.expose_secret().as_bytes());
        let mut key = [0u8; 32];
        hk.expand(VAULT_HKDF_INFO, &mut key)
            .map_err(|_| StorageError::IoFailure {
                key: dir.display().to_string(),
                reason: "cannot derive vault key".to_string(),
            })?;

        Ok(Self {
            dir,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    fn seal(&self, key: &str, value: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::IoFailure {
                key: key.to_string(),
                reason: "encryption failed".to_string(),
            })?;

        let mut record = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    fn unseal(&self, key: &str, record: &[u8]) -> Result<Vec<u8>, StorageError> {
        let corrupt = || StorageError::Corrupt {
            key: key.to_string(),
            reason: "record failed authentication".to_string(),
        };
        if record.len() < NONCE_LENGTH {
            return Err(corrupt());
        }
        let (nonce, ciphertext) = record.split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| corrupt())
    }
}

fn io_failure(key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::IoFailure {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

fn with_dir_lock<T>(
    dir: &Path,
    key: &str,
    op: impl FnOnce() -> std::io::Result<T>,
) -> Result<T, StorageError> {
    fs::create_dir_all(dir).map_err(|e| io_failure(key, e))?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .map_err(|e| io_failure(key, e))?;
    lock.lock_exclusive().map_err(|e| io_failure(key, e))?;
    let result = op().map_err(|e| io_failure(key, e));
    if let Err(e) = lock.unlock() {
        tracing::warn!(error = %e, "Failed to release vault lock");
    }
    result
}

async fn blocking<T: Send + 'static>(
    key: &str,
    task: impl FnOnce() -> Result<T, StorageError> + Send + 'static,
) -> Result<T, StorageError> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| io_failure(key, e))?
}

#[async_trait]
impl Vault for FileVault {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.record_path(key);
        let owned_key = key.to_string();
        let record = blocking(key, move || match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_failure(&owned_key, e)),
        })
        .await?;

        record.map(|record| self.unseal(key, &record)).transpose()
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let record = self.seal(key, value)?;
        let dir = self.dir.clone();
        let path = self.record_path(key);
        let owned_key = key.to_string();

        blocking(key, move || {
            with_dir_lock(&dir, &owned_key, || {
                let tmp = path.with_extension("tmp");
                let mut file = File::create(&tmp)?;
                file.write_all(&record)?;
                file.sync_all()?;
                fs::rename(&tmp, &path)
            })
        })
        .await?;
        tracing::debug!(vault = %self.dir.display(), "Saved vault record");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let dir = self.dir.clone();
        let path = self.record_path(key);
        let owned_key = key.to_string();

        blocking(key, move || {
            with_dir_lock(&dir, &owned_key, || match fs::remove_file(&path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            })
        })
        .await
    }
}
