use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use bioseal_core::{InitOptions, StorageError, StorageResult};
use bioseal_storage::{entry_store::EncryptedEntryStore, key_provider::KeyStore};
use tracing::{debug, warn};

/// One initialized entry. Operations on it run one at a time.
pub struct Entry<K: KeyStore> {
    name: String,
    options: InitOptions,
    store: tokio::sync::Mutex<EncryptedEntryStore<K>>,
}

impl<K: KeyStore> Entry<K> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &InitOptions {
        &self.options
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, EncryptedEntryStore<K>> {
        self.store.lock().await
    }

    /// `None` while another operation holds the entry.
    pub fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, EncryptedEntryStore<K>>> {
        self.store.try_lock().ok()
    }
}

/// Name to entry map, owned by the engine.
pub struct EntryRegistry<K: KeyStore> {
    entries: Mutex<HashMap<String, Arc<Entry<K>>>>,
}

impl<K: KeyStore> Default for EntryRegistry<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: KeyStore> EntryRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. An existing registration is kept (returns `false`)
    /// unless `force` is set, in which case it is an error.
    pub fn initialize(
        &self,
        name: &str,
        options: InitOptions,
        force: bool,
        build: impl FnOnce(&InitOptions) -> EncryptedEntryStore<K>,
    ) -> StorageResult<bool> {
        let mut entries = self.entries()?;
        if entries.contains_key(name) {
            if force {
                return Err(StorageError::new(
                    bioseal_core::ErrorKind::AlreadyInitialized,
                    format!("A storage file with the name '{name}' was already initialized."),
                ));
            }
            debug!(entry = name, "already initialized, keeping existing options");
            return Ok(false);
        }
        let store = build(&options);
        entries.insert(
            name.to_string(),
            Arc::new(Entry {
                name: name.to_string(),
                options,
                store: tokio::sync::Mutex::new(store),
            }),
        );
        Ok(true)
    }

    /// Forget `name` without touching its data.
    pub fn dispose(&self, name: &str) -> StorageResult<()> {
        match self.entries()?.remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_initialized(name)),
        }
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<Entry<K>>> {
        self.entries()?.get(name).cloned().ok_or_else(|| {
            warn!(entry = name, "entry was not initialized");
            StorageError::not_initialized(name)
        })
    }

    /// Run `f` against a registered entry. The one pre-check every entry operation goes through.
    pub async fn with_entry<T, F, Fut>(&self, name: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(Arc<Entry<K>>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let entry = self.get(name)?;
        f(entry).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries()
            .map(|entries| entries.contains_key(name))
            .unwrap_or(false)
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.entries()?.clear();
        Ok(())
    }

    pub fn snapshot(&self) -> StorageResult<Vec<Arc<Entry<K>>>> {
        Ok(self.entries()?.values().cloned().collect())
    }

    fn entries(&self) -> StorageResult<MutexGuard<'_, HashMap<String, Arc<Entry<K>>>>> {
        self.entries
            .lock()
            .map_err(|err| StorageError::unexpected(format!("entry registry poisoned: {err}")))
    }
}
