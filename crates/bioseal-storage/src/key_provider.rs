use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bioseal_core::{auth::AllowedFactors, CipherMode, InitOptions};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const KEY_SUFFIX: &str = "_master_key";

/// Derived key alias for an entry.
pub fn master_key_name(entry: &str) -> String {
    format!("{entry}{KEY_SUFFIX}")
}

/// Where the key material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyBacking {
    /// Dedicated tamper-resistant hardware.
    SecureElement,
    /// Best available OS-isolated keystore.
    Software,
}

/// When the key may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAuthorization {
    /// No user presence required.
    None,
    /// Each cipher must be authorized by a fresh challenge.
    PerOperation(AllowedFactors),
    /// Usable for `seconds` after any successful user authentication.
    TimeWindow {
        seconds: u32,
        allowed: AllowedFactors,
    },
}

/// Parameters for generating an entry's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub name: String,
    pub authorization: KeyAuthorization,
    pub require_secure_element: bool,
}

impl KeySpec {
    pub fn for_entry(entry: &str, options: &InitOptions, require_secure_element: bool) -> Self {
        let allowed = AllowedFactors::for_biometric_only(options.biometric_only);
        let authorization = if !options.authentication_required {
            KeyAuthorization::None
        } else if options.uses_time_window() {
            KeyAuthorization::TimeWindow {
                seconds: options.authentication_validity_duration_seconds.max(0) as u32,
                allowed,
            }
        } else {
            KeyAuthorization::PerOperation(allowed)
        };
        Self {
            name: master_key_name(entry),
            authorization,
            require_secure_element,
        }
    }
}

/// Key material used for encryption at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Key alias (never log key bytes).
    pub name: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
    pub backing: KeyBacking,
    pub authorization: KeyAuthorization,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("name", &self.name)
            .field("bytes", &"<redacted>")
            .field("backing", &self.backing)
            .field("authorization", &self.authorization)
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
    #[error("secure element required but not available")]
    SecureElementUnavailable,
    #[error("key {name} was permanently invalidated")]
    Invalidated { name: String },
    #[error("key {name} requires user authentication")]
    NotAuthenticated { name: String },
    #[error("cipher for key {actual} used with key {expected}")]
    ForeignCipher { expected: String, actual: String },
    #[error("cipher initialized for the wrong mode, expected {expected:?}")]
    WrongMode { expected: CipherMode },
    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Moment of the most recent successful user authentication, shared by every
/// time-window key of a keystore.
#[derive(Debug, Default, Clone)]
pub struct UserAuthClock {
    last: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl UserAuthClock {
    pub fn mark(&self) {
        self.mark_at(Utc::now());
    }

    pub fn mark_at(&self, at: DateTime<Utc>) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(at);
        }
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last.lock().ok().and_then(|last| *last)
    }

    /// Whether an authentication happened within the last `seconds`.
    pub fn within(&self, seconds: u32) -> bool {
        match self.last() {
            Some(at) => Utc::now() - at <= Duration::seconds(i64::from(seconds)),
            None => false,
        }
    }
}

/// Holds per-entry keys (OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Whether dedicated secure hardware is advertised.
    fn has_secure_element(&self) -> bool;

    /// Fetch a key. `Err(Invalidated)` when the platform revoked it.
    async fn load(&self, name: &str) -> Result<Option<KeyMaterial>, KeyError>;

    async fn generate(&self, spec: &KeySpec) -> Result<KeyMaterial, KeyError>;

    /// Idempotent.
    async fn delete(&self, name: &str) -> Result<(), KeyError>;

    fn auth_clock(&self) -> &UserAuthClock;
}

/// OS keyring-backed store. Uses the `keyring` crate to hold one key per entry.
pub struct KeyringKeyStore {
    service: String,
    secure_element: bool,
    clock: UserAuthClock,
}

impl KeyringKeyStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            secure_element: false,
            clock: UserAuthClock::default(),
        }
    }

    /// Declare the platform credential store hardware-backed.
    pub fn with_secure_element(mut self, available: bool) -> Self {
        self.secure_element = available;
        self
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, name).map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

#[async_trait]
impl KeyStore for KeyringKeyStore {
    fn has_secure_element(&self) -> bool {
        self.secure_element
    }

    async fn load(&self, name: &str) -> Result<Option<KeyMaterial>, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        let entry = self.entry(name)?;
        match entry.get_password() {
            Ok(secret) => match decode_key(name, &secret) {
                Ok(material) => Ok(Some(material)),
                Err(err) => {
                    warn!(key = name, "stored key is unreadable: {err}");
                    Err(KeyError::Invalidated {
                        name: name.to_string(),
                    })
                }
            },
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    async fn generate(&self, spec: &KeySpec) -> Result<KeyMaterial, KeyError> {
        let material = generate_key(spec, self.secure_element)?;
        self.entry(&spec.name)?
            .set_password(&encode_key(&material)?)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        debug!(key = %spec.name, backing = ?material.backing, "generated key");
        Ok(material)
    }

    async fn delete(&self, name: &str) -> Result<(), KeyError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    fn auth_clock(&self) -> &UserAuthClock {
        &self.clock
    }
}

#[derive(Debug, Default)]
struct MemoryKeys {
    keys: HashMap<String, KeyMaterial>,
    invalidated: HashSet<String>,
    always_invalid: HashSet<String>,
    deletions: HashMap<String, u32>,
}

/// In-memory key store for tests and ephemeral sessions. Can simulate
/// platform invalidation (e.g. a newly enrolled fingerprint).
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyStore {
    inner: Arc<Mutex<MemoryKeys>>,
    secure_element: bool,
    clock: UserAuthClock,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secure_element(mut self) -> Self {
        self.secure_element = true;
        self
    }

    /// Revoke an existing key until it is deleted.
    pub fn invalidate(&self, name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.keys.contains_key(name) {
                guard.invalidated.insert(name.to_string());
            }
        }
    }

    /// Revoke the alias for good: even a freshly generated key reports invalidation.
    pub fn invalidate_persistently(&self, name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.always_invalid.insert(name.to_string());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.keys.contains_key(name))
            .unwrap_or(false)
    }

    pub fn deletions(&self, name: &str) -> u32 {
        self.inner
            .lock()
            .ok()
            .and_then(|guard| guard.deletions.get(name).copied())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryKeys>, KeyError> {
        self.inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    fn has_secure_element(&self) -> bool {
        self.secure_element
    }

    async fn load(&self, name: &str) -> Result<Option<KeyMaterial>, KeyError> {
        let guard = self.lock()?;
        if guard.always_invalid.contains(name) || guard.invalidated.contains(name) {
            return Err(KeyError::Invalidated {
                name: name.to_string(),
            });
        }
        Ok(guard.keys.get(name).cloned())
    }

    async fn generate(&self, spec: &KeySpec) -> Result<KeyMaterial, KeyError> {
        let material = generate_key(spec, self.secure_element)?;
        let mut guard = self.lock()?;
        guard.invalidated.remove(&spec.name);
        guard.keys.insert(spec.name.clone(), material.clone());
        Ok(material)
    }

    async fn delete(&self, name: &str) -> Result<(), KeyError> {
        let mut guard = self.lock()?;
        guard.keys.remove(name);
        guard.invalidated.remove(name);
        *guard.deletions.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn auth_clock(&self) -> &UserAuthClock {
        &self.clock
    }
}

fn generate_key(spec: &KeySpec, secure_element: bool) -> Result<KeyMaterial, KeyError> {
    let backing = if secure_element {
        KeyBacking::SecureElement
    } else if spec.require_secure_element {
        return Err(KeyError::SecureElementUnavailable);
    } else {
        KeyBacking::Software
    };

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Ok(KeyMaterial {
        name: spec.name.clone(),
        bytes,
        backing,
        authorization: spec.authorization,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    key: String,
    backing: KeyBacking,
    authorization: KeyAuthorization,
}

fn encode_key(material: &KeyMaterial) -> Result<String, KeyError> {
    let stored = StoredKey {
        key: general_purpose::STANDARD.encode(material.bytes),
        backing: material.backing,
        authorization: material.authorization,
    };
    serde_json::to_string(&stored).map_err(|e| KeyError::Generation(e.to_string()))
}

fn decode_key(name: &str, secret: &str) -> Result<KeyMaterial, KeyError> {
    let stored: StoredKey =
        serde_json::from_str(secret).map_err(|e| KeyError::Decode(e.to_string()))?;
    let bytes = general_purpose::STANDARD
        .decode(stored.key)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if bytes.len() != 32 {
        return Err(KeyError::Decode(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(KeyMaterial {
        name: name.to_string(),
        bytes: out,
        backing: stored.backing,
        authorization: stored.authorization,
    })
}
