//! Hardware-key abstraction and per-entry encrypted files.
//! Uses AES-GCM with keys held by a `KeyStore` (OS keyring or test doubles).

pub mod cipher;
pub mod entry_store;
pub mod key_provider;

use bioseal_core::{ErrorKind, StorageError};

use crate::{entry_store::StoreError, key_provider::KeyError};

impl From<KeyError> for StorageError {
    fn from(err: KeyError) -> Self {
        let kind = match &err {
            KeyError::Keyring(_)
            | KeyError::Generation(_)
            | KeyError::SecureElementUnavailable => ErrorKind::KeyProvisioning,
            KeyError::Invalidated { .. } => ErrorKind::KeyInvalidated,
            KeyError::NotAuthenticated { .. } => ErrorKind::ResetRequired,
            KeyError::Decode(_) | KeyError::Crypto(_) => ErrorKind::Decryption,
            KeyError::ForeignCipher { .. } | KeyError::WrongMode { .. } => ErrorKind::Unexpected,
        };
        StorageError::new(kind, err.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { path, reason } => {
                StorageError::new(ErrorKind::Io, reason).with_details(path)
            }
            StoreError::Key(key) => key.into(),
        }
    }
}
