use std::sync::Arc;

use bioseal_core::{
    auth::{
        challenge_channel, AllowedFactors, AuthFactor, BiometricApi, BiometricPrompter,
        BiometricRequest, CanAuthenticateResponse, ChallengeOutcome, DeviceCapabilities,
        DeviceCredentialPrompter, FingerprintSensor, ScriptedAuthenticator, StaticCapabilities,
    },
    ErrorKind, PromptInfo, StorageError, StorageResult,
};
use tracing::{debug, instrument};

/// Platform drivers supplied by the host when it attaches.
#[derive(Clone)]
pub struct AuthDrivers {
    pub capabilities: Arc<dyn DeviceCapabilities>,
    pub biometric: Arc<dyn BiometricPrompter>,
    pub fingerprint: Arc<dyn FingerprintSensor>,
    pub credential: Arc<dyn DeviceCredentialPrompter>,
}

impl AuthDrivers {
    /// Route every driver to one scripted authenticator.
    pub fn scripted(capabilities: StaticCapabilities, auth: ScriptedAuthenticator) -> Self {
        let auth = Arc::new(auth);
        Self {
            capabilities: Arc::new(capabilities),
            biometric: auth.clone(),
            fingerprint: auth.clone(),
            credential: auth,
        }
    }
}

/// How challenges are issued on this device. Chosen once per capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStrategy {
    /// Unified prompt; device credential when no biometric is enrolled.
    ModernBiometric,
    /// Raw fingerprint first, then the device credential.
    LegacyFingerprintThenPin,
    DeviceCredentialOnly,
}

impl ChallengeStrategy {
    pub fn probe(drivers: &AuthDrivers) -> Self {
        match drivers.capabilities.biometric_api() {
            BiometricApi::Modern => ChallengeStrategy::ModernBiometric,
            BiometricApi::Legacy if drivers.fingerprint.is_hardware_detected() => {
                ChallengeStrategy::LegacyFingerprintThenPin
            }
            BiometricApi::Legacy | BiometricApi::Unavailable => {
                ChallengeStrategy::DeviceCredentialOnly
            }
        }
    }
}

/// What one operation needs from a challenge.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeRequest<'a> {
    pub prompt: &'a PromptInfo,
    pub biometric_only: bool,
    /// A per-operation cipher is waiting on this challenge.
    pub crypto_bound: bool,
}

/// Issues challenges through the strategy probed at attach time.
pub struct Challenger {
    strategy: ChallengeStrategy,
    drivers: AuthDrivers,
}

impl Challenger {
    pub fn probe(drivers: AuthDrivers) -> Self {
        let strategy = ChallengeStrategy::probe(&drivers);
        debug!(?strategy, "selected challenge strategy");
        Self { strategy, drivers }
    }

    pub fn strategy(&self) -> ChallengeStrategy {
        self.strategy
    }

    /// Run one challenge to completion, degrading through the strategy's tiers.
    #[instrument(skip_all, fields(strategy = ?self.strategy, biometric_only = request.biometric_only))]
    pub async fn challenge(&self, request: ChallengeRequest<'_>) -> StorageResult<AuthFactor> {
        match self.strategy {
            ChallengeStrategy::ModernBiometric => {
                let enrolled = self
                    .drivers
                    .capabilities
                    .can_authenticate(AllowedFactors::BIOMETRIC_STRONG)
                    == CanAuthenticateResponse::Success;
                if enrolled || request.biometric_only {
                    into_factor(self.biometric(&request).await)
                } else {
                    debug!("no enrolled biometric, using device credential");
                    into_factor(self.device_credential(request.prompt).await)
                }
            }
            ChallengeStrategy::LegacyFingerprintThenPin => {
                if !self.drivers.fingerprint.has_enrolled_fingerprints() {
                    if request.biometric_only {
                        return Err(StorageError::new(
                            ErrorKind::AuthUnavailable,
                            "no fingerprint enrolled and device credential not allowed",
                        ));
                    }
                    return into_factor(self.device_credential(request.prompt).await);
                }
                match self.fingerprint().await {
                    ChallengeOutcome::Authenticated(factor) => Ok(factor),
                    ChallengeOutcome::UserCanceled => into_factor(ChallengeOutcome::UserCanceled),
                    failed if request.biometric_only => into_factor(failed),
                    failed => {
                        debug!(?failed, "fingerprint failed, falling back to device credential");
                        into_factor(self.device_credential(request.prompt).await)
                    }
                }
            }
            ChallengeStrategy::DeviceCredentialOnly => {
                if request.biometric_only {
                    return Err(StorageError::new(
                        ErrorKind::AuthUnavailable,
                        "no biometric facility and device credential not allowed",
                    ));
                }
                into_factor(self.device_credential(request.prompt).await)
            }
        }
    }

    pub fn can_authenticate(&self) -> CanAuthenticateResponse {
        self.drivers
            .capabilities
            .can_authenticate(AllowedFactors::BIOMETRIC_STRONG)
    }

    /// Whether any factor (biometric or device credential) is usable.
    pub fn has_auth_mechanism(&self) -> bool {
        match self.strategy {
            ChallengeStrategy::ModernBiometric => {
                self.drivers
                    .capabilities
                    .can_authenticate(AllowedFactors::BIOMETRIC_OR_CREDENTIAL)
                    == CanAuthenticateResponse::Success
            }
            ChallengeStrategy::LegacyFingerprintThenPin | ChallengeStrategy::DeviceCredentialOnly => {
                self.drivers.fingerprint.has_enrolled_fingerprints()
                    || self.drivers.credential.is_device_secure()
            }
        }
    }

    async fn biometric(&self, request: &ChallengeRequest<'_>) -> ChallengeOutcome {
        let (responder, pending) = challenge_channel();
        self.drivers.biometric.authenticate(
            BiometricRequest {
                prompt: request.prompt.clone(),
                allowed: AllowedFactors::for_biometric_only(request.biometric_only),
                crypto_bound: request.crypto_bound,
                show_negative_button: request.biometric_only,
            },
            responder,
        );
        pending.outcome().await
    }

    async fn fingerprint(&self) -> ChallengeOutcome {
        let (responder, pending) = challenge_channel();
        self.drivers.fingerprint.authenticate(responder);
        pending.outcome().await
    }

    async fn device_credential(&self, prompt: &PromptInfo) -> ChallengeOutcome {
        if !self.drivers.credential.is_device_secure() {
            return ChallengeOutcome::Unavailable(
                "device has no secure lock screen credential".to_string(),
            );
        }
        let (responder, pending) = challenge_channel();
        self.drivers.credential.confirm_credential(prompt, responder);
        pending.outcome().await
    }
}

fn into_factor(outcome: ChallengeOutcome) -> StorageResult<AuthFactor> {
    let (kind, message) = match outcome {
        ChallengeOutcome::Authenticated(factor) => return Ok(factor),
        ChallengeOutcome::UserCanceled => (
            ErrorKind::AuthChallengeCanceled,
            "authentication canceled by user".to_string(),
        ),
        ChallengeOutcome::SessionCanceled => (
            ErrorKind::AuthSessionCanceled,
            "authentication session was canceled".to_string(),
        ),
        ChallengeOutcome::Timeout => (
            ErrorKind::AuthChallengeTimeout,
            "authentication timed out".to_string(),
        ),
        ChallengeOutcome::NoMatch => (
            ErrorKind::AuthChallengeFailedNoMatch,
            "authentication failed".to_string(),
        ),
        ChallengeOutcome::Unavailable(message) => (ErrorKind::AuthUnavailable, message),
        ChallengeOutcome::Error(message) => (ErrorKind::Unexpected, message),
    };
    Err(StorageError::new(kind, message))
}
