use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use bioseal_core::{
    auth::CanAuthenticateResponse,
    observe::{Observer, StorageEvent},
    ErrorKind, InitOptions, PromptInfo, StorageError, StorageResult,
};
use bioseal_storage::{
    entry_store::EncryptedEntryStore,
    key_provider::{KeySpec, KeyStore},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    challenge::{AuthDrivers, ChallengeStrategy, Challenger},
    orchestrator::{AuthenticationOrchestrator, EntryOp, OpOutput},
    registry::{Entry, EntryRegistry},
};

/// What gets wiped when a read finds data it can no longer decrypt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Only the affected entry.
    #[default]
    Entry,
    /// Every registered entry; the registry is cleared as well.
    AllEntries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Application-private data directory.
    pub root: PathBuf,
    pub require_secure_element: bool,
    pub reset_policy: ResetPolicy,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            require_secure_element: false,
            reset_policy: ResetPolicy::default(),
        }
    }
}

/// Host-facing entry point. Owns the registry and the attached host's drivers.
pub struct BiometricStorage<K: KeyStore> {
    config: EngineConfig,
    keystore: Arc<K>,
    registry: EntryRegistry<K>,
    challenger: RwLock<Option<Arc<Challenger>>>,
    observer: Arc<dyn Observer>,
}

impl<K: KeyStore + 'static> BiometricStorage<K> {
    pub fn new(config: EngineConfig, keystore: Arc<K>, observer: Arc<dyn Observer>) -> Self {
        Self {
            config,
            keystore,
            registry: EntryRegistry::new(),
            challenger: RwLock::new(None),
            observer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Probe the host's capabilities once and keep its drivers for challenges.
    pub fn attach_host(&self, drivers: AuthDrivers) -> ChallengeStrategy {
        let challenger = Challenger::probe(drivers);
        let strategy = challenger.strategy();
        if let Ok(mut slot) = self.challenger.write() {
            *slot = Some(Arc::new(challenger));
        }
        info!(?strategy, "host attached");
        strategy
    }

    /// Drop the host's drivers and forget every registration.
    pub fn detach_host(&self) -> StorageResult<()> {
        if let Ok(mut slot) = self.challenger.write() {
            *slot = None;
        }
        let result = self.registry.clear();
        info!("host detached");
        self.reported(result)
    }

    /// Register `name`. Returns `false` if it was already registered.
    #[instrument(skip(self, options))]
    pub fn init(&self, name: &str, options: InitOptions, force: bool) -> StorageResult<bool> {
        let result = require_name(name).and_then(|()| {
            self.registry
                .initialize(name, options.normalized(), force, |options| {
                    self.build_store(name, options)
                })
        });
        self.reported(result)
    }

    pub fn dispose(&self, name: &str) -> StorageResult<bool> {
        let result = require_name(name)
            .and_then(|()| self.registry.dispose(name))
            .map(|()| true);
        self.reported(result)
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Decrypt the entry. `None` when nothing was written yet.
    #[instrument(skip(self, prompt))]
    pub async fn read(&self, name: &str, prompt: &PromptInfo) -> StorageResult<Option<String>> {
        let result = self.read_entry(name, prompt).await;
        self.reported(result)
    }

    #[instrument(skip(self, content, prompt))]
    pub async fn write(
        &self,
        name: &str,
        content: &str,
        prompt: &PromptInfo,
    ) -> StorageResult<bool> {
        let result = self.write_entry(name, content, prompt).await;
        self.reported(result)
    }

    /// Remove the key and payload. `false` when there was no payload.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> StorageResult<bool> {
        let result = self.delete_entry(name).await;
        self.reported(result)
    }

    pub fn can_authenticate(&self) -> StorageResult<CanAuthenticateResponse> {
        let result = self.attached().map(|challenger| challenger.can_authenticate());
        self.reported(result)
    }

    pub fn has_auth_mechanism(&self) -> StorageResult<bool> {
        let result = self.attached().map(|challenger| challenger.has_auth_mechanism());
        self.reported(result)
    }

    async fn read_entry(&self, name: &str, prompt: &PromptInfo) -> StorageResult<Option<String>> {
        require_name(name)?;
        self.registry
            .with_entry(name, |entry| async move {
                let challenger = self.challenger();
                // Held through the reset so no queued operation sees a half-wiped entry.
                let store = entry.lock().await;
                let result = AuthenticationOrchestrator::new(
                    challenger.as_deref(),
                    self.observer.as_ref(),
                )
                .run(&store, entry.options(), prompt, EntryOp::Read)
                .await;
                match result {
                    Ok(OpOutput::Read(content)) => Ok(content),
                    Ok(OpOutput::Written) => {
                        Err(StorageError::unexpected("read resolved as a write"))
                    }
                    Err(err) if err.kind == ErrorKind::ResetRequired => {
                        self.reset_after_failed_read(&entry, &store).await;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            })
            .await
    }

    async fn write_entry(
        &self,
        name: &str,
        content: &str,
        prompt: &PromptInfo,
    ) -> StorageResult<bool> {
        require_name(name)?;
        self.registry
            .with_entry(name, |entry| async move {
                let challenger = self.challenger();
                let store = entry.lock().await;
                let output = AuthenticationOrchestrator::new(
                    challenger.as_deref(),
                    self.observer.as_ref(),
                )
                .run(&store, entry.options(), prompt, EntryOp::Write(content))
                .await?;
                match output {
                    OpOutput::Written => Ok(true),
                    OpOutput::Read(_) => Err(StorageError::unexpected("write resolved as a read")),
                }
            })
            .await
    }

    async fn delete_entry(&self, name: &str) -> StorageResult<bool> {
        require_name(name)?;
        self.registry
            .with_entry(name, |entry| async move {
                let store = entry.lock().await;
                Ok::<_, StorageError>(store.delete().await?)
            })
            .await
    }

    /// Wipe what the reset policy covers, using the failing operation's guard on
    /// `store`. Failures here are recorded, never returned; the caller already has
    /// the reset error to surface.
    async fn reset_after_failed_read(&self, entry: &Entry<K>, store: &EncryptedEntryStore<K>) {
        match self.config.reset_policy {
            ResetPolicy::Entry => {
                if store.exists() {
                    self.wipe(store).await;
                }
            }
            ResetPolicy::AllEntries => {
                let entries = match self.registry.snapshot() {
                    Ok(entries) => entries,
                    Err(err) => {
                        self.record(&err);
                        return;
                    }
                };
                warn!(entries = entries.len(), "resetting all entries");
                for other in entries {
                    if other.name() == entry.name() {
                        self.wipe(store).await;
                        continue;
                    }
                    // A busy entry is mid-operation with a working key; leave it.
                    match other.try_lock() {
                        Some(other_store) => self.wipe(&other_store).await,
                        None => warn!(entry = other.name(), "entry busy, not reset"),
                    }
                }
                if let Err(err) = self.registry.clear() {
                    self.record(&err);
                }
            }
        }
    }

    async fn wipe(&self, store: &EncryptedEntryStore<K>) {
        debug!(entry = store.name(), "wiping entry");
        if let Err(err) = store.delete().await {
            self.record(&StorageError::from(err));
        }
    }

    fn build_store(&self, name: &str, options: &InitOptions) -> EncryptedEntryStore<K> {
        EncryptedEntryStore::new(
            &self.config.root,
            name,
            KeySpec::for_entry(name, options, self.config.require_secure_element),
            self.keystore.clone(),
            self.observer.clone(),
        )
    }

    fn challenger(&self) -> Option<Arc<Challenger>> {
        self.challenger.read().ok().and_then(|slot| slot.clone())
    }

    fn attached(&self) -> StorageResult<Arc<Challenger>> {
        self.challenger()
            .ok_or_else(|| StorageError::unexpected("no host attached"))
    }

    fn reported<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    fn record(&self, err: &StorageError) {
        // The entry store reports its own I/O failures.
        if err.kind != ErrorKind::Io {
            self.observer.record(StorageEvent::error(err));
        }
    }
}

fn require_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::missing_argument("name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bioseal_core::{
        auth::{
            AuthFactor, BiometricPrompter, BiometricRequest, ChallengeKind, ChallengeOutcome,
            ChallengeResponder, ScriptedAuthenticator, StaticCapabilities,
        },
        observe::ChannelObserver,
    };
    use bioseal_storage::{
        entry_store::payload_path,
        key_provider::{master_key_name, InMemoryKeyStore},
    };
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    struct Harness {
        _dir: TempDir,
        keys: Arc<InMemoryKeyStore>,
        auth: ScriptedAuthenticator,
        storage: BiometricStorage<InMemoryKeyStore>,
        events: UnboundedReceiver<StorageEvent>,
    }

    impl Harness {
        fn new(capabilities: StaticCapabilities, auth: ScriptedAuthenticator) -> Self {
            Self::with_policy(capabilities, auth, ResetPolicy::Entry)
        }

        fn with_policy(
            capabilities: StaticCapabilities,
            auth: ScriptedAuthenticator,
            reset_policy: ResetPolicy,
        ) -> Self {
            let dir = tempdir().unwrap();
            let keys = Arc::new(InMemoryKeyStore::new());
            let (observer, events) = ChannelObserver::new();
            let config = EngineConfig {
                reset_policy,
                ..EngineConfig::new(dir.path())
            };
            let storage = BiometricStorage::new(config, keys.clone(), Arc::new(observer));
            storage.attach_host(AuthDrivers::scripted(capabilities, auth.clone()));
            Self {
                _dir: dir,
                keys,
                auth,
                storage,
                events,
            }
        }

        fn modern() -> Self {
            Self::new(StaticCapabilities::modern(true), ScriptedAuthenticator::new())
        }

        fn payload(&self, name: &str) -> Vec<u8> {
            std::fs::read(payload_path(&self.storage.config().root, name)).unwrap()
        }

        fn payload_exists(&self, name: &str) -> bool {
            payload_path(&self.storage.config().root, name).exists()
        }

        fn error_codes(&mut self) -> Vec<String> {
            let mut codes = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let StorageEvent::Error(payload) = event {
                    codes.push(payload.code);
                }
            }
            codes
        }
    }

    fn no_auth() -> InitOptions {
        InitOptions {
            authentication_required: false,
            ..InitOptions::default()
        }
    }

    fn with_fallback() -> InitOptions {
        InitOptions {
            biometric_only: false,
            ..InitOptions::default()
        }
    }

    #[tokio::test]
    async fn unauthenticated_entry_never_challenges() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("plain", no_auth(), false).unwrap();

        assert!(h.storage.write("plain", "x", &prompt).await.unwrap());
        assert_eq!(
            h.storage.read("plain", &prompt).await.unwrap().as_deref(),
            Some("x")
        );
        assert!(h.auth.challenges().is_empty());
        // nonce, one byte of ciphertext, tag
        assert_eq!(h.payload("plain").len(), 12 + 1 + 16);
    }

    #[tokio::test]
    async fn vault_scenario_challenges_each_operation() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        assert!(h.storage.init("vault", InitOptions::default(), false).unwrap());

        assert!(h.storage.write("vault", "secret", &prompt).await.unwrap());
        assert_eq!(h.auth.challenges(), vec![ChallengeKind::Biometric]);
        let on_disk = h.payload("vault");
        assert!(!on_disk.windows(6).any(|w| w == b"secret"));

        let content = h.storage.read("vault", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("secret"));
        assert_eq!(
            h.auth.challenges(),
            vec![ChallengeKind::Biometric, ChallengeKind::Biometric]
        );
        assert!(h.auth.biometric_requests().iter().all(|r| r.crypto_bound));
    }

    #[tokio::test]
    async fn canceled_challenge_leaves_payload_unchanged() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();
        h.storage.write("vault", "first", &prompt).await.unwrap();
        let before = h.payload("vault");

        h.auth.push_outcome(ChallengeOutcome::UserCanceled);
        let err = h.storage.write("vault", "second", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthChallengeCanceled);
        assert_eq!(h.payload("vault"), before);

        h.auth.push_outcome(ChallengeOutcome::UserCanceled);
        let err = h.storage.read("vault", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthChallengeCanceled);
        assert!(h.payload_exists("vault"));

        let content = h.storage.read("vault", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn timeout_and_session_cancel_are_distinct() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();

        h.auth.push_outcome(ChallengeOutcome::Timeout);
        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthChallengeTimeout);

        h.auth.push_outcome(ChallengeOutcome::SessionCanceled);
        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthSessionCanceled);

        h.auth.push_outcome(ChallengeOutcome::NoMatch);
        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthChallengeFailedNoMatch);
    }

    #[tokio::test]
    async fn round_trips_awkward_strings() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();

        for value in ["", "nul\0inside", "héllo wörld 🔐", "line\nbreaks\r\n"] {
            h.storage.write("vault", value, &prompt).await.unwrap();
            let read = h.storage.read("vault", &prompt).await.unwrap();
            assert_eq!(read.as_deref(), Some(value));
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("plain", no_auth(), false).unwrap();

        assert!(!h.storage.delete("plain").await.unwrap());
        assert!(!h.storage.delete("plain").await.unwrap());

        h.storage.write("plain", "x", &prompt).await.unwrap();
        assert!(h.storage.delete("plain").await.unwrap());
        assert!(!h.storage.delete("plain").await.unwrap());
        assert_eq!(h.storage.read("plain", &prompt).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_of_unwritten_entry_is_absent_without_challenge() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();

        assert_eq!(h.storage.read("vault", &prompt).await.unwrap(), None);
        assert!(h.auth.challenges().is_empty());
    }

    #[test]
    fn init_guard() {
        let mut h = Harness::modern();
        assert!(h.storage.init("a", InitOptions::default(), false).unwrap());
        assert!(!h.storage.init("a", InitOptions::default(), false).unwrap());
        let err = h.storage.init("a", InitOptions::default(), true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyInitialized);
        assert_eq!(h.error_codes(), vec!["AlreadyInitialized".to_string()]);

        assert!(h.storage.dispose("a").unwrap());
        assert!(!h.storage.is_initialized("a"));
        assert_eq!(
            h.storage.dispose("a").unwrap_err().kind,
            ErrorKind::NotInitialized
        );
    }

    #[tokio::test]
    async fn uninitialized_and_unnamed_entries_are_rejected() {
        let mut h = Harness::modern();
        let prompt = PromptInfo::default();

        let err = h.storage.read("nope", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInitialized);
        assert_eq!(err.message, "Storage nope was not initialized.");
        let err = h.storage.delete("nope").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInitialized);

        let err = h.storage.init("", InitOptions::default(), false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingArgument);
        let err = h.storage.write("", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingArgument);

        assert_eq!(
            h.error_codes(),
            vec![
                "NotInitialized".to_string(),
                "NotInitialized".to_string(),
                "MissingArgument".to_string(),
                "MissingArgument".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn invalidated_key_on_read_resets_once() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();
        h.storage.write("vault", "secret", &prompt).await.unwrap();
        let challenges = h.auth.challenges().len();

        h.keys.invalidate(&master_key_name("vault"));
        let err = h.storage.read("vault", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResetRequired);
        assert_eq!(h.keys.deletions(&master_key_name("vault")), 1);
        assert!(!h.payload_exists("vault"));
        assert_eq!(h.auth.challenges().len(), challenges);

        // The entry is usable again with a fresh key.
        h.storage.write("vault", "again", &prompt).await.unwrap();
        let content = h.storage.read("vault", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn persistent_invalidation_does_not_loop() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();
        h.keys.invalidate_persistently(&master_key_name("vault"));

        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResetRequired);
        assert_eq!(h.keys.deletions(&master_key_name("vault")), 1);
        assert!(h.auth.challenges().is_empty());
    }

    #[tokio::test]
    async fn invalidated_unauthenticated_write_recreates_key() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("plain", no_auth(), false).unwrap();
        h.storage.write("plain", "old", &prompt).await.unwrap();

        h.keys.invalidate(&master_key_name("plain"));
        assert!(h.storage.write("plain", "new", &prompt).await.unwrap());
        assert_eq!(h.keys.deletions(&master_key_name("plain")), 1);
        let content = h.storage.read("plain", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("new"));
    }

    struct InvalidatingPrompter {
        keys: Arc<InMemoryKeyStore>,
        key: String,
    }

    impl BiometricPrompter for InvalidatingPrompter {
        fn authenticate(&self, _request: BiometricRequest, responder: ChallengeResponder) {
            self.keys.invalidate(&self.key);
            responder.resolve(ChallengeOutcome::Authenticated(AuthFactor::BiometricStrong));
        }
    }

    #[tokio::test]
    async fn failure_after_successful_challenge_requires_reset() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        let scripted = Arc::new(ScriptedAuthenticator::new());
        h.storage.attach_host(AuthDrivers {
            capabilities: Arc::new(StaticCapabilities::modern(true)),
            biometric: Arc::new(InvalidatingPrompter {
                keys: h.keys.clone(),
                key: master_key_name("vault"),
            }),
            fingerprint: scripted.clone(),
            credential: scripted,
        });
        h.storage.init("vault", InitOptions::default(), false).unwrap();

        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResetRequired);
        assert!(err.details.is_some());
        assert!(!h.payload_exists("vault"));
    }

    #[tokio::test]
    async fn unenrolled_device_uses_device_credential() {
        let h = Harness::new(StaticCapabilities::modern(false), ScriptedAuthenticator::new());
        let prompt = PromptInfo::default();
        h.storage.init("vault", with_fallback(), false).unwrap();

        h.storage.write("vault", "x", &prompt).await.unwrap();
        assert_eq!(h.auth.challenges(), vec![ChallengeKind::DeviceCredential]);
        let content = h.storage.read("vault", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn device_credential_fallback_flag_overrides_biometric_only() {
        let h = Harness::new(StaticCapabilities::modern(false), ScriptedAuthenticator::new());
        let prompt = PromptInfo::default();
        let options = InitOptions {
            device_credential_fallback: true,
            ..InitOptions::default()
        };
        h.storage.init("vault", options, false).unwrap();

        h.storage.write("vault", "x", &prompt).await.unwrap();
        assert_eq!(h.auth.challenges(), vec![ChallengeKind::DeviceCredential]);
    }

    #[tokio::test]
    async fn legacy_device_degrades_to_pin() {
        let auth = ScriptedAuthenticator::new().with_outcomes([ChallengeOutcome::NoMatch]);
        let h = Harness::new(StaticCapabilities::legacy(), auth);
        let prompt = PromptInfo::default();
        h.storage.init("vault", with_fallback(), false).unwrap();

        h.storage.write("vault", "x", &prompt).await.unwrap();
        assert_eq!(
            h.auth.challenges(),
            vec![ChallengeKind::Fingerprint, ChallengeKind::DeviceCredential]
        );
    }

    #[tokio::test]
    async fn no_factor_is_unavailable() {
        let auth = ScriptedAuthenticator::new()
            .without_fingerprint_hardware()
            .insecure_device();
        let h = Harness::new(
            StaticCapabilities::unavailable().without_device_credential(),
            auth,
        );
        let prompt = PromptInfo::default();
        h.storage.init("vault", with_fallback(), false).unwrap();

        let err = h.storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthUnavailable);
        assert!(!h.storage.has_auth_mechanism().unwrap());
        assert_eq!(
            h.storage.can_authenticate().unwrap(),
            CanAuthenticateResponse::ErrorNoHardware
        );
    }

    #[tokio::test]
    async fn time_window_entry_challenges_each_operation() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        let options = InitOptions {
            authentication_validity_duration_seconds: 30,
            ..with_fallback()
        };
        h.storage.init("window", options, false).unwrap();

        h.storage.write("window", "a", &prompt).await.unwrap();
        h.storage.write("window", "b", &prompt).await.unwrap();
        assert_eq!(h.auth.challenges().len(), 2);
        assert!(h.auth.biometric_requests().iter().all(|r| !r.crypto_bound));
        assert!(h.keys.auth_clock().last().is_some());
    }

    #[tokio::test]
    async fn biometric_only_time_window_reuses_recent_authentication() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        let options = InitOptions {
            authentication_validity_duration_seconds: 30,
            ..InitOptions::default()
        };
        h.storage.init("window", options, false).unwrap();

        h.storage.write("window", "a", &prompt).await.unwrap();
        h.storage.write("window", "b", &prompt).await.unwrap();
        let content = h.storage.read("window", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("b"));
        assert_eq!(h.auth.challenges(), vec![ChallengeKind::Biometric]);
    }

    #[tokio::test]
    async fn all_entries_policy_wipes_everything() {
        let h = Harness::with_policy(
            StaticCapabilities::modern(true),
            ScriptedAuthenticator::new(),
            ResetPolicy::AllEntries,
        );
        let prompt = PromptInfo::default();
        h.storage.init("a", no_auth(), false).unwrap();
        h.storage.init("b", no_auth(), false).unwrap();
        h.storage.write("a", "1", &prompt).await.unwrap();
        h.storage.write("b", "2", &prompt).await.unwrap();

        h.keys.invalidate(&master_key_name("a"));
        let err = h.storage.read("a", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResetRequired);

        assert!(!h.payload_exists("a"));
        assert!(!h.payload_exists("b"));
        assert!(!h.keys.contains(&master_key_name("b")));
        assert!(!h.storage.is_initialized("a"));
        assert!(!h.storage.is_initialized("b"));
    }

    #[tokio::test]
    async fn entry_policy_leaves_other_entries() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("a", no_auth(), false).unwrap();
        h.storage.init("b", no_auth(), false).unwrap();
        h.storage.write("a", "1", &prompt).await.unwrap();
        h.storage.write("b", "2", &prompt).await.unwrap();

        h.keys.invalidate(&master_key_name("a"));
        h.storage.read("a", &prompt).await.unwrap_err();

        assert!(h.storage.is_initialized("a"));
        let content = h.storage.read("b", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn corrupted_payload_is_reported_not_returned() {
        let mut h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("plain", no_auth(), false).unwrap();
        h.storage.write("plain", "x", &prompt).await.unwrap();

        let path = payload_path(&h.storage.config().root, "plain");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(h.storage.read("plain", &prompt).await.unwrap(), None);
        assert_eq!(h.error_codes(), vec!["DecryptionError".to_string()]);
    }

    #[tokio::test]
    async fn without_host_challenges_are_unexpected() {
        let dir = tempdir().unwrap();
        let storage = BiometricStorage::new(
            EngineConfig::new(dir.path()),
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(bioseal_core::observe::TracingObserver),
        );
        let prompt = PromptInfo::default();
        storage.init("vault", InitOptions::default(), false).unwrap();
        storage.init("plain", no_auth(), false).unwrap();

        let err = storage.write("vault", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert_eq!(
            storage.can_authenticate().unwrap_err().kind,
            ErrorKind::Unexpected
        );
        assert!(storage.write("plain", "x", &prompt).await.unwrap());
    }

    #[tokio::test]
    async fn detach_clears_registry() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("vault", InitOptions::default(), false).unwrap();

        h.storage.detach_host().unwrap();
        assert!(!h.storage.is_initialized("vault"));
        let err = h.storage.read("vault", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn entries_operate_concurrently() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("a", no_auth(), false).unwrap();
        h.storage.init("b", InitOptions::default(), false).unwrap();

        let (a, b) = tokio::join!(
            h.storage.write("a", "first", &prompt),
            h.storage.write("b", "second", &prompt)
        );
        assert!(a.unwrap() && b.unwrap());

        let (a, b) = tokio::join!(h.storage.read("a", &prompt), h.storage.read("b", &prompt));
        assert_eq!(a.unwrap().as_deref(), Some("first"));
        assert_eq!(b.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn zero_second_window_round_trips() {
        for biometric_only in [false, true] {
            let h = Harness::modern();
            let prompt = PromptInfo::default();
            let options = InitOptions {
                authentication_validity_duration_seconds: 0,
                biometric_only,
                ..InitOptions::default()
            };
            h.storage.init("instant", options, false).unwrap();

            assert!(h.storage.write("instant", "x", &prompt).await.unwrap());
            let content = h.storage.read("instant", &prompt).await.unwrap();
            assert_eq!(content.as_deref(), Some("x"));
            assert!(!h.auth.challenges().is_empty());
        }
    }

    #[tokio::test]
    async fn queued_write_survives_reset_of_failed_read() {
        let h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("v", no_auth(), false).unwrap();
        h.storage.write("v", "old", &prompt).await.unwrap();
        h.keys.invalidate(&master_key_name("v"));

        // Hold the entry so the read queues first and the write queues behind it.
        let entry = h.storage.registry.get("v").unwrap();
        let guard = entry.lock().await;
        let (read, write, ()) = tokio::join!(
            h.storage.read("v", &prompt),
            async {
                tokio::task::yield_now().await;
                h.storage.write("v", "new", &prompt).await
            },
            async move {
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                drop(guard);
            }
        );

        assert_eq!(read.unwrap_err().kind, ErrorKind::ResetRequired);
        assert!(write.unwrap());
        let content = h.storage.read("v", &prompt).await.unwrap();
        assert_eq!(content.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn io_failure_on_write_is_reported_once() {
        let mut h = Harness::modern();
        let prompt = PromptInfo::default();
        h.storage.init("plain", no_auth(), false).unwrap();
        std::fs::write(h.storage.config().root.join("biometric_storage"), b"not a dir").unwrap();

        let err = h.storage.write("plain", "x", &prompt).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.details.is_some());
        assert_eq!(h.error_codes(), vec!["IOError".to_string()]);
    }

    #[tokio::test]
    async fn missing_secure_element_fails_provisioning() {
        let dir = tempdir().unwrap();
        let (observer, mut events) = ChannelObserver::new();
        let config = EngineConfig {
            require_secure_element: true,
            ..EngineConfig::new(dir.path())
        };
        let storage = BiometricStorage::new(
            config,
            Arc::new(InMemoryKeyStore::new()),
            Arc::new(observer),
        );
        storage.attach_host(AuthDrivers::scripted(
            StaticCapabilities::modern(true),
            ScriptedAuthenticator::new(),
        ));
        storage.init("vault", InitOptions::default(), false).unwrap();

        let err = storage
            .write("vault", "x", &PromptInfo::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyProvisioning);
        assert!(!payload_path(dir.path(), "vault").exists());
        assert!(matches!(
            events.try_recv(),
            Ok(StorageEvent::Error(payload)) if payload.code == "KeyProvisioning"
        ));
    }

    #[tokio::test]
    async fn secure_element_backed_keystore_provisions() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            require_secure_element: true,
            ..EngineConfig::new(dir.path())
        };
        let storage = BiometricStorage::new(
            config,
            Arc::new(InMemoryKeyStore::new().with_secure_element()),
            Arc::new(bioseal_core::observe::TracingObserver),
        );
        storage.init("plain", no_auth(), false).unwrap();
        assert!(storage
            .write("plain", "x", &PromptInfo::default())
            .await
            .unwrap());
    }
}
