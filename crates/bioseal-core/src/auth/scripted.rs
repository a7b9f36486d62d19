use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use super::{
    AllowedFactors, AuthFactor, BiometricApi, BiometricPrompter, BiometricRequest,
    CanAuthenticateResponse, ChallengeOutcome, ChallengeResponder, DeviceCapabilities,
    DeviceCredentialPrompter, FingerprintSensor,
};
use crate::options::PromptInfo;

/// Which driver a challenge was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Biometric,
    Fingerprint,
    DeviceCredential,
}

#[derive(Debug)]
struct ScriptState {
    outcomes: VecDeque<ChallengeOutcome>,
    challenges: Vec<ChallengeKind>,
    biometric_requests: Vec<BiometricRequest>,
}

/// Driver that answers every challenge from a queue of outcomes and records
/// what it was asked. Once the queue is empty every challenge succeeds with the
/// factor matching the driver. Useful for tests and headless smoke runs.
#[derive(Debug, Clone)]
pub struct ScriptedAuthenticator {
    state: Arc<Mutex<ScriptState>>,
    fingerprint_hardware: bool,
    fingerprints_enrolled: bool,
    device_secure: bool,
}

impl Default for ScriptedAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAuthenticator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                outcomes: VecDeque::new(),
                challenges: Vec::new(),
                biometric_requests: Vec::new(),
            })),
            fingerprint_hardware: true,
            fingerprints_enrolled: true,
            device_secure: true,
        }
    }

    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = ChallengeOutcome>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.extend(outcomes);
        }
        self
    }

    pub fn without_fingerprints(mut self) -> Self {
        self.fingerprints_enrolled = false;
        self
    }

    pub fn without_fingerprint_hardware(mut self) -> Self {
        self.fingerprint_hardware = false;
        self.fingerprints_enrolled = false;
        self
    }

    pub fn insecure_device(mut self) -> Self {
        self.device_secure = false;
        self
    }

    /// Queue another outcome after construction.
    pub fn push_outcome(&self, outcome: ChallengeOutcome) {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.push_back(outcome);
        }
    }

    pub fn challenges(&self) -> Vec<ChallengeKind> {
        self.state
            .lock()
            .map(|state| state.challenges.clone())
            .unwrap_or_default()
    }

    pub fn biometric_requests(&self) -> Vec<BiometricRequest> {
        self.state
            .lock()
            .map(|state| state.biometric_requests.clone())
            .unwrap_or_default()
    }

    fn answer(&self, kind: ChallengeKind, factor: AuthFactor, responder: ChallengeResponder) {
        let scripted = match self.state.lock() {
            Ok(mut state) => {
                state.challenges.push(kind);
                state.outcomes.pop_front()
            }
            Err(_) => Some(ChallengeOutcome::Error("script lock poisoned".to_string())),
        };
        responder.resolve(scripted.unwrap_or(ChallengeOutcome::Authenticated(factor)));
    }
}

impl BiometricPrompter for ScriptedAuthenticator {
    fn authenticate(&self, request: BiometricRequest, responder: ChallengeResponder) {
        if let Ok(mut state) = self.state.lock() {
            state.biometric_requests.push(request);
        }
        self.answer(
            ChallengeKind::Biometric,
            AuthFactor::BiometricStrong,
            responder,
        );
    }
}

impl FingerprintSensor for ScriptedAuthenticator {
    fn is_hardware_detected(&self) -> bool {
        self.fingerprint_hardware
    }

    fn has_enrolled_fingerprints(&self) -> bool {
        self.fingerprints_enrolled
    }

    fn authenticate(&self, responder: ChallengeResponder) {
        self.answer(
            ChallengeKind::Fingerprint,
            AuthFactor::BiometricStrong,
            responder,
        );
    }
}

impl DeviceCredentialPrompter for ScriptedAuthenticator {
    fn is_device_secure(&self) -> bool {
        self.device_secure
    }

    fn confirm_credential(&self, _prompt: &PromptInfo, responder: ChallengeResponder) {
        self.answer(
            ChallengeKind::DeviceCredential,
            AuthFactor::DeviceCredential,
            responder,
        );
    }
}

/// Fixed capability profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCapabilities {
    pub api: BiometricApi,
    pub strong_biometric: CanAuthenticateResponse,
    pub device_credential: bool,
}

impl StaticCapabilities {
    pub fn modern(biometric_enrolled: bool) -> Self {
        Self {
            api: BiometricApi::Modern,
            strong_biometric: if biometric_enrolled {
                CanAuthenticateResponse::Success
            } else {
                CanAuthenticateResponse::ErrorNoBiometricEnrolled
            },
            device_credential: true,
        }
    }

    pub fn legacy() -> Self {
        Self {
            api: BiometricApi::Legacy,
            strong_biometric: CanAuthenticateResponse::ErrorHwUnavailable,
            device_credential: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            api: BiometricApi::Unavailable,
            strong_biometric: CanAuthenticateResponse::ErrorNoHardware,
            device_credential: true,
        }
    }

    pub fn without_device_credential(mut self) -> Self {
        self.device_credential = false;
        self
    }
}

impl DeviceCapabilities for StaticCapabilities {
    fn biometric_api(&self) -> BiometricApi {
        self.api
    }

    fn can_authenticate(&self, allowed: AllowedFactors) -> CanAuthenticateResponse {
        if allowed.biometric_strong && self.strong_biometric == CanAuthenticateResponse::Success {
            return CanAuthenticateResponse::Success;
        }
        if allowed.device_credential && self.device_credential {
            return CanAuthenticateResponse::Success;
        }
        if allowed.biometric_strong {
            self.strong_biometric
        } else {
            CanAuthenticateResponse::ErrorNoHardware
        }
    }
}
