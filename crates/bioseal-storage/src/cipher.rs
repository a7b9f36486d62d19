use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use bioseal_core::{auth::AuthFactor, CipherMode};
use tracing::debug;

use crate::key_provider::{KeyAuthorization, KeyError, KeyMaterial, KeySpec, KeyStore};

/// Length of the nonce that prefixes every payload.
pub const NONCE_LEN: usize = 12;

/// A cryptographic context bound to one key and one direction.
/// An encrypt handle seals exactly one payload; its nonce is never reused.
pub struct CipherHandle {
    key: KeyMaterial,
    mode: CipherMode,
    nonce: [u8; NONCE_LEN],
    authorized_by: Option<AuthFactor>,
    sealed: AtomicBool,
}

impl CipherHandle {
    pub fn key_name(&self) -> &str {
        &self.key.name
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Whether this handle is unusable until a challenge authorizes it.
    pub fn requires_per_operation_auth(&self) -> bool {
        matches!(self.key.authorization, KeyAuthorization::PerOperation(_))
    }

    /// Bind the handle to a successful challenge.
    pub fn authorize(&mut self, factor: AuthFactor) {
        self.authorized_by = Some(factor);
    }

    pub fn authorized_by(&self) -> Option<AuthFactor> {
        self.authorized_by
    }
}

impl fmt::Debug for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherHandle")
            .field("key", &self.key.name)
            .field("mode", &self.mode)
            .field("authorized_by", &self.authorized_by)
            .finish()
    }
}

/// Wraps one entry's hardware-resident key and hands out cipher handles for it.
pub struct KeyBackedCipherProvider<K: KeyStore> {
    keystore: Arc<K>,
    spec: KeySpec,
}

impl<K: KeyStore> KeyBackedCipherProvider<K> {
    pub fn new(keystore: Arc<K>, spec: KeySpec) -> Self {
        Self { keystore, spec }
    }

    pub fn key_name(&self) -> &str {
        &self.spec.name
    }

    pub fn keystore(&self) -> &K {
        &self.keystore
    }

    /// Cipher with a fresh nonce, generating the key on first use.
    pub async fn cipher_for_encrypt(&self) -> Result<CipherHandle, KeyError> {
        let key = match self.keystore.load(&self.spec.name).await? {
            Some(key) => key,
            None => self.keystore.generate(&self.spec).await?,
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut bytes = [0u8; NONCE_LEN];
        bytes.copy_from_slice(nonce.as_slice());
        Ok(CipherHandle {
            key,
            mode: CipherMode::Encrypt,
            nonce: bytes,
            authorized_by: None,
            sealed: AtomicBool::new(false),
        })
    }

    /// Cipher for an existing payload, or `None` when nothing was written yet.
    pub async fn cipher_for_decrypt(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<CipherHandle>, KeyError> {
        let Some(payload) = payload else {
            debug!(key = %self.spec.name, "no payload, no nonce. null cipher");
            return Ok(None);
        };
        let key = self
            .keystore
            .load(&self.spec.name)
            .await?
            .ok_or_else(|| self.invalidated())?;
        let nonce = split_nonce(payload)?;
        Ok(Some(CipherHandle {
            key,
            mode: CipherMode::Decrypt,
            nonce,
            authorized_by: None,
            sealed: AtomicBool::new(false),
        }))
    }

    /// Returns `nonce || ciphertext`.
    pub async fn encrypt_data(
        &self,
        plaintext: &[u8],
        cipher: &CipherHandle,
    ) -> Result<Vec<u8>, KeyError> {
        let aead = self.check_usable(cipher, CipherMode::Encrypt).await?;
        if cipher.sealed.swap(true, Ordering::AcqRel) {
            return Err(KeyError::Crypto("encrypt cipher already used".to_string()));
        }
        let ciphertext = aead
            .encrypt(Nonce::from_slice(&cipher.nonce), plaintext)
            .map_err(|e| KeyError::Crypto(format!("encrypt failed: {e}")))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&cipher.nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    pub async fn decrypt_data(
        &self,
        framed: &[u8],
        cipher: &CipherHandle,
    ) -> Result<Vec<u8>, KeyError> {
        let aead = self.check_usable(cipher, CipherMode::Decrypt).await?;
        if split_nonce(framed)? != cipher.nonce {
            return Err(KeyError::Crypto(
                "payload nonce does not match cipher".to_string(),
            ));
        }
        aead.decrypt(Nonce::from_slice(&cipher.nonce), &framed[NONCE_LEN..])
            .map_err(|e| KeyError::Crypto(format!("decrypt failed: {e}")))
    }

    /// Idempotent; succeeds when the key is already gone.
    pub async fn delete_key(&self) -> Result<(), KeyError> {
        self.keystore.delete(&self.spec.name).await
    }

    async fn check_usable(
        &self,
        cipher: &CipherHandle,
        mode: CipherMode,
    ) -> Result<Aes256Gcm, KeyError> {
        if cipher.key_name() != self.spec.name {
            return Err(KeyError::ForeignCipher {
                expected: self.spec.name.clone(),
                actual: cipher.key_name().to_string(),
            });
        }
        if cipher.mode != mode {
            return Err(KeyError::WrongMode { expected: mode });
        }

        // The key may have been revoked or recreated since the handle was issued.
        let current = self
            .keystore
            .load(&self.spec.name)
            .await?
            .ok_or_else(|| self.invalidated())?;
        if current.bytes != cipher.key.bytes {
            return Err(self.invalidated());
        }

        let authorized = match cipher.key.authorization {
            KeyAuthorization::None => true,
            KeyAuthorization::PerOperation(allowed) => cipher
                .authorized_by
                .is_some_and(|factor| allowed.allows(factor)),
            // A handle authorized by the challenge it was acquired for is
            // usable even when the window is already over (e.g. 0 seconds).
            KeyAuthorization::TimeWindow { seconds, allowed } => {
                cipher
                    .authorized_by
                    .is_some_and(|factor| allowed.allows(factor))
                    || self.keystore.auth_clock().within(seconds)
            }
        };
        if !authorized {
            return Err(KeyError::NotAuthenticated {
                name: self.spec.name.clone(),
            });
        }

        Aes256Gcm::new_from_slice(&cipher.key.bytes)
            .map_err(|e| KeyError::Crypto(format!("cipher init failed: {e}")))
    }

    fn invalidated(&self) -> KeyError {
        KeyError::Invalidated {
            name: self.spec.name.clone(),
        }
    }
}

fn split_nonce(payload: &[u8]) -> Result<[u8; NONCE_LEN], KeyError> {
    if payload.len() < NONCE_LEN {
        return Err(KeyError::Crypto(format!(
            "payload too short: {} bytes",
            payload.len()
        )));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    Ok(nonce)
}
