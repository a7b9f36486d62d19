use std::{
    fs,
    io::{ErrorKind as IoErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bioseal_core::{
    observe::{Observer, StorageEvent},
    StorageError,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    cipher::{CipherHandle, KeyBackedCipherProvider},
    key_provider::{KeyError, KeySpec, KeyStore},
};

/// Directory inside the data root where all encrypted files are stored.
const DIRECTORY_NAME: &str = "biometric_storage";
const FILE_SUFFIX: &str = ".v2.bin";

/// Location of an entry's payload under `root`.
pub fn payload_path(root: &Path, entry: &str) -> PathBuf {
    root.join(DIRECTORY_NAME)
        .join(format!("{}{FILE_SUFFIX}", sanitize_name(entry)))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io failure on {path}: {reason}")]
    Io { path: String, reason: String },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The encrypted payload of one named entry, bound to that entry's own key.
///
/// Callers serialize access per entry; the registry hands out the store
/// behind an async mutex.
pub struct EncryptedEntryStore<K: KeyStore> {
    name: String,
    path: PathBuf,
    provider: KeyBackedCipherProvider<K>,
    observer: Arc<dyn Observer>,
}

impl<K: KeyStore> EncryptedEntryStore<K> {
    pub fn new(
        root: impl AsRef<Path>,
        name: &str,
        spec: KeySpec,
        keystore: Arc<K>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: payload_path(root.as_ref(), name),
            provider: KeyBackedCipherProvider::new(keystore, spec),
            observer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn provider(&self) -> &KeyBackedCipherProvider<K> {
        &self.provider
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn cipher_for_encrypt(&self) -> Result<CipherHandle, StoreError> {
        Ok(self.provider.cipher_for_encrypt().await?)
    }

    /// `None` when there is no payload yet.
    pub async fn cipher_for_decrypt(&self) -> Result<Option<CipherHandle>, StoreError> {
        let payload = self.read_payload()?;
        Ok(self.provider.cipher_for_decrypt(payload.as_deref()).await?)
    }

    /// Encrypt and atomically replace the payload. Without a cipher a fresh
    /// one is obtained from the entry's key.
    #[instrument(skip_all, fields(entry = %self.name))]
    pub async fn write(
        &self,
        cipher: Option<&CipherHandle>,
        content: &str,
    ) -> Result<(), StoreError> {
        let fresh;
        let cipher = match cipher {
            Some(cipher) => cipher,
            None => {
                fresh = self.provider.cipher_for_encrypt().await?;
                &fresh
            }
        };
        let framed = self.provider.encrypt_data(content.as_bytes(), cipher).await?;
        write_atomically(&self.path, &framed).map_err(|err| self.report(err))?;
        debug!(bytes = framed.len(), "successfully written");
        Ok(())
    }

    /// Decrypt the payload. Absent payloads and undecryptable content both
    /// yield `None`; the latter is reported to the observer.
    #[instrument(skip_all, fields(entry = %self.name))]
    pub async fn read(&self, cipher: Option<&CipherHandle>) -> Result<Option<String>, StoreError> {
        let Some(framed) = self.read_payload()? else {
            debug!("file does not exist, returning none");
            return Ok(None);
        };

        let fresh;
        let cipher = match cipher {
            Some(cipher) => cipher,
            None => match self.provider.cipher_for_decrypt(Some(&framed)).await? {
                Some(cipher) => {
                    fresh = cipher;
                    &fresh
                }
                None => return Ok(None),
            },
        };

        match self.provider.decrypt_data(&framed, cipher).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => Ok(Some(content)),
                Err(err) => {
                    self.report_undecryptable(format!("payload is not utf-8: {err}"));
                    Ok(None)
                }
            },
            Err(KeyError::Crypto(reason)) => {
                self.report_undecryptable(reason);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the key first, then the payload. Returns whether a payload existed.
    /// A payload without its key is unusable, so a failed file removal leaves
    /// nothing readable behind.
    #[instrument(skip_all, fields(entry = %self.name))]
    pub async fn delete(&self) -> Result<bool, StoreError> {
        self.provider.delete_key().await?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.report(io_err(&self.path, err))),
        }
    }

    fn read_payload(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                debug!(bytes = bytes.len(), "read payload");
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.report(io_err(&self.path, err))),
        }
    }

    fn report(&self, err: StoreError) -> StoreError {
        if let StoreError::Io { path, reason } = &err {
            let error = StorageError::new(bioseal_core::ErrorKind::Io, reason.clone())
                .with_details(path.clone());
            self.observer.record(StorageEvent::error(&error));
        }
        err
    }

    fn report_undecryptable(&self, reason: String) {
        let error = StorageError::new(
            bioseal_core::ErrorKind::Decryption,
            format!("unable to decrypt {}", self.name),
        )
        .with_details(reason);
        self.observer.record(StorageEvent::error(&error));
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| StoreError::Io {
        path: path.display().to_string(),
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| io_err(parent, e))?;
    tmp.write_all(bytes).map_err(|e| io_err(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name)
}

fn io_err(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
