use serde::{Deserialize, Serialize};

/// Which direction a cipher handle was initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// Per-entry configuration fixed at `init` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    /// When false the entry is still encrypted, but never prompts.
    pub authentication_required: bool,
    /// `-1` requires a fresh challenge per operation; `>= 0` makes the key
    /// usable for that many seconds after any successful authentication.
    pub authentication_validity_duration_seconds: i32,
    /// Restrict challenges to strong biometrics (no device credential).
    pub biometric_only: bool,
    /// Explicitly allow the device credential; overrides `biometric_only`.
    pub device_credential_fallback: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            authentication_required: true,
            authentication_validity_duration_seconds: -1,
            biometric_only: true,
            device_credential_fallback: false,
        }
    }
}

impl InitOptions {
    /// Resolve the fallback override into `biometric_only`.
    pub fn normalized(mut self) -> Self {
        if self.device_credential_fallback {
            self.biometric_only = false;
        }
        self
    }

    /// Whether the key is gated by a rolling time window instead of per operation.
    pub fn uses_time_window(&self) -> bool {
        self.authentication_validity_duration_seconds > -1
    }
}

/// Prompt strings handed to whichever authenticator ends up being shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptInfo {
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub negative_button: String,
    pub confirmation_required: bool,
}

impl Default for PromptInfo {
    fn default() -> Self {
        Self {
            title: "Authenticate to access data".to_string(),
            subtitle: None,
            description: None,
            negative_button: "Cancel".to_string(),
            confirmation_required: true,
        }
    }
}
