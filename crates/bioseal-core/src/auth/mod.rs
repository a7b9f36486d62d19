//! Capability contracts for platform authenticators.
//!
//! The engine never renders UI or talks to sensors itself. Hosts implement the
//! driver traits below; each driver receives a [`ChallengeResponder`] and
//! resolves it exactly once, from any thread, when the platform reports back.

mod channel;
mod scripted;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::options::PromptInfo;

pub use channel::{challenge_channel, ChallengeResponder, PendingChallenge};
pub use scripted::{ChallengeKind, ScriptedAuthenticator, StaticCapabilities};

/// Factor that satisfied a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthFactor {
    BiometricStrong,
    DeviceCredential,
}

/// Set of factors a key or prompt accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedFactors {
    pub biometric_strong: bool,
    pub device_credential: bool,
}

impl AllowedFactors {
    pub const BIOMETRIC_STRONG: Self = Self {
        biometric_strong: true,
        device_credential: false,
    };

    pub const BIOMETRIC_OR_CREDENTIAL: Self = Self {
        biometric_strong: true,
        device_credential: true,
    };

    pub fn for_biometric_only(biometric_only: bool) -> Self {
        if biometric_only {
            Self::BIOMETRIC_STRONG
        } else {
            Self::BIOMETRIC_OR_CREDENTIAL
        }
    }

    pub fn allows(self, factor: AuthFactor) -> bool {
        match factor {
            AuthFactor::BiometricStrong => self.biometric_strong,
            AuthFactor::DeviceCredential => self.device_credential,
        }
    }
}

/// Answer to "can this device authenticate with the given factors?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanAuthenticateResponse {
    Success,
    ErrorHwUnavailable,
    ErrorNoBiometricEnrolled,
    ErrorNoHardware,
    ErrorStatusUnknown,
}

impl fmt::Display for CanAuthenticateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CanAuthenticateResponse::Success => "Success",
            CanAuthenticateResponse::ErrorHwUnavailable => "ErrorHwUnavailable",
            CanAuthenticateResponse::ErrorNoBiometricEnrolled => "ErrorNoBiometricEnrolled",
            CanAuthenticateResponse::ErrorNoHardware => "ErrorNoHardware",
            CanAuthenticateResponse::ErrorStatusUnknown => "ErrorStatusUnknown",
        };
        f.write_str(name)
    }
}

/// Which biometric facility the platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiometricApi {
    /// Unified biometric prompt that can also offer the device credential.
    Modern,
    /// Only raw fingerprint matching is available.
    Legacy,
    Unavailable,
}

/// Terminal result of one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Authenticated(AuthFactor),
    /// User pressed the negative button or dismissed the prompt.
    UserCanceled,
    /// The platform tore the prompt down (app backgrounded, sensor reset, ...).
    SessionCanceled,
    Timeout,
    /// Platform stopped accepting attempts after repeated mismatches.
    NoMatch,
    /// The requested factor cannot be used on this device.
    Unavailable(String),
    Error(String),
}

/// Parameters for the unified biometric prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricRequest {
    pub prompt: PromptInfo,
    pub allowed: AllowedFactors,
    /// Whether the prompt guards a per-operation cipher.
    pub crypto_bound: bool,
    /// Whether the negative button must be shown (absent when the credential
    /// itself is offered as the alternative).
    pub show_negative_button: bool,
}

/// Probes device state. Queried once when a host attaches, and for status calls.
pub trait DeviceCapabilities: Send + Sync {
    fn biometric_api(&self) -> BiometricApi;

    fn can_authenticate(&self, allowed: AllowedFactors) -> CanAuthenticateResponse;
}

/// Unified biometric prompt.
pub trait BiometricPrompter: Send + Sync {
    fn authenticate(&self, request: BiometricRequest, responder: ChallengeResponder);
}

/// Raw fingerprint matcher on platforms without the unified prompt.
pub trait FingerprintSensor: Send + Sync {
    fn is_hardware_detected(&self) -> bool;

    fn has_enrolled_fingerprints(&self) -> bool;

    fn authenticate(&self, responder: ChallengeResponder);
}

/// Device unlock credential (PIN, pattern, password).
pub trait DeviceCredentialPrompter: Send + Sync {
    fn is_device_secure(&self) -> bool;

    fn confirm_credential(&self, prompt: &PromptInfo, responder: ChallengeResponder);
}
