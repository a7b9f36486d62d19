//! Decides whether an operation needs a challenge, acquires the cipher, and
//! recovers from key invalidation with exactly one reset-and-retry.

use bioseal_core::{
    observe::{Observer, StorageEvent},
    CipherMode, InitOptions, PromptInfo, StorageError, StorageResult,
};
use bioseal_storage::{
    cipher::CipherHandle,
    entry_store::{EncryptedEntryStore, StoreError},
    key_provider::{KeyError, KeyStore},
};
use tracing::{debug, warn};

use crate::challenge::{ChallengeRequest, Challenger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    CipherAcquisition,
    NoChallengeNeeded,
    AwaitingUserChallenge,
    Resolved,
}

/// The cryptographic I/O an operation performs once authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp<'a> {
    Read,
    Write(&'a str),
}

impl EntryOp<'_> {
    pub fn mode(&self) -> CipherMode {
        match self {
            EntryOp::Read => CipherMode::Decrypt,
            EntryOp::Write(_) => CipherMode::Encrypt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput {
    Read(Option<String>),
    Written,
}

/// Drives one operation. Consumed by [`AuthenticationOrchestrator::run`]; it
/// never outlives the call.
pub struct AuthenticationOrchestrator<'a> {
    challenger: Option<&'a Challenger>,
    observer: &'a dyn Observer,
    state: AuthState,
}

impl<'a> AuthenticationOrchestrator<'a> {
    pub fn new(challenger: Option<&'a Challenger>, observer: &'a dyn Observer) -> Self {
        Self {
            challenger,
            observer,
            state: AuthState::Idle,
        }
    }

    pub async fn run<K: KeyStore>(
        mut self,
        store: &EncryptedEntryStore<K>,
        options: &InitOptions,
        prompt: &PromptInfo,
        op: EntryOp<'_>,
    ) -> StorageResult<OpOutput> {
        let result = self.drive(store, options, prompt, op).await;
        self.transition(AuthState::Resolved);
        result
    }

    async fn drive<K: KeyStore>(
        &mut self,
        store: &EncryptedEntryStore<K>,
        options: &InitOptions,
        prompt: &PromptInfo,
        op: EntryOp<'_>,
    ) -> StorageResult<OpOutput> {
        if !options.authentication_required {
            self.transition(AuthState::NoChallengeNeeded);
            return self.run_unauthenticated(store, op).await;
        }

        self.transition(AuthState::CipherAcquisition);
        let mut cipher = self.acquire(store, op.mode()).await?;
        if cipher.is_none() {
            debug!(entry = store.name(), "nothing stored, skipping challenge");
            return Ok(OpOutput::Read(None));
        }

        let per_operation = cipher
            .as_ref()
            .is_some_and(CipherHandle::requires_per_operation_auth);
        if options.biometric_only && !per_operation {
            // Nothing to bind to a prompt; the key may still be inside its window.
            self.transition(AuthState::NoChallengeNeeded);
            match execute(store, op, cipher.as_ref()).await {
                Ok(output) => return Ok(output),
                Err(StoreError::Key(KeyError::NotAuthenticated { .. })) => {
                    debug!("user requires (re)authentication. showing prompt");
                }
                Err(StoreError::Key(err)) => {
                    return Err(StorageError::reset_required(
                        "trying to ask for a prompt with an invalid key",
                    )
                    .with_details(err.to_string()))
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.transition(AuthState::AwaitingUserChallenge);
        let challenger = self.challenger.ok_or_else(|| {
            StorageError::unexpected("no host attached to show an authentication prompt")
        })?;
        let factor = challenger
            .challenge(ChallengeRequest {
                prompt,
                biometric_only: options.biometric_only,
                crypto_bound: per_operation,
            })
            .await?;

        store.provider().keystore().auth_clock().mark();
        if let Some(cipher) = cipher.as_mut() {
            cipher.authorize(factor);
        }

        execute(store, op, cipher.as_ref())
            .await
            .map_err(|err| match err {
                StoreError::Key(err) => StorageError::reset_required(
                    "key became unusable after successful authentication",
                )
                .with_details(err.to_string()),
                io => io.into(),
            })
    }

    /// Cipher for `mode`, resetting the entry once if its key was invalidated.
    async fn acquire<K: KeyStore>(
        &mut self,
        store: &EncryptedEntryStore<K>,
        mode: CipherMode,
    ) -> StorageResult<Option<CipherHandle>> {
        match cipher_for_mode(store, mode).await {
            Err(StoreError::Key(KeyError::Invalidated { name })) => {
                self.reset_after_invalidation(store, &name).await?;
                match cipher_for_mode(store, mode).await {
                    Ok(Some(cipher)) => Ok(Some(cipher)),
                    Ok(None) => Err(StorageError::reset_required(format!(
                        "data of {} was discarded after key invalidation",
                        store.name()
                    ))),
                    Err(err) => Err(StorageError::reset_required(
                        "key was invalidated again after reset",
                    )
                    .with_details(err.to_string())),
                }
            }
            other => Ok(other?),
        }
    }

    /// No challenge and no caller cipher: the store uses its unguarded key.
    async fn run_unauthenticated<K: KeyStore>(
        &mut self,
        store: &EncryptedEntryStore<K>,
        op: EntryOp<'_>,
    ) -> StorageResult<OpOutput> {
        match execute(store, op, None).await {
            Err(StoreError::Key(KeyError::Invalidated { name })) => {
                self.reset_after_invalidation(store, &name).await?;
                match op {
                    EntryOp::Read => Err(StorageError::reset_required(format!(
                        "data of {} was discarded after key invalidation",
                        store.name()
                    ))),
                    EntryOp::Write(_) => {
                        execute(store, op, None).await.map_err(|err| match err {
                            StoreError::Key(err) => StorageError::reset_required(
                                "key was invalidated again after reset",
                            )
                            .with_details(err.to_string()),
                            io => io.into(),
                        })
                    }
                }
            }
            other => Ok(other?),
        }
    }

    async fn reset_after_invalidation<K: KeyStore>(
        &mut self,
        store: &EncryptedEntryStore<K>,
        key: &str,
    ) -> StorageResult<()> {
        warn!(key, "key was invalidated. removing previous storage and recreating");
        self.observer.record(StorageEvent::warn(format!(
            "key {key} was invalidated; resetting entry {}",
            store.name()
        )));
        store.delete().await?;
        Ok(())
    }

    fn transition(&mut self, next: AuthState) {
        debug!(from = ?self.state, to = ?next, "auth state");
        self.state = next;
    }
}

async fn cipher_for_mode<K: KeyStore>(
    store: &EncryptedEntryStore<K>,
    mode: CipherMode,
) -> Result<Option<CipherHandle>, StoreError> {
    match mode {
        CipherMode::Encrypt => store.cipher_for_encrypt().await.map(Some),
        CipherMode::Decrypt => store.cipher_for_decrypt().await,
    }
}

async fn execute<K: KeyStore>(
    store: &EncryptedEntryStore<K>,
    op: EntryOp<'_>,
    cipher: Option<&CipherHandle>,
) -> Result<OpOutput, StoreError> {
    match op {
        EntryOp::Read => store.read(cipher).await.map(OpOutput::Read),
        EntryOp::Write(content) => store
            .write(cipher, content)
            .await
            .map(|()| OpOutput::Written),
    }
}
