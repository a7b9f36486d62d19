use std::{
    io::{self, BufRead, Write},
    thread,
};

use bioseal_core::{
    auth::{
        AuthFactor, BiometricPrompter, BiometricRequest, ChallengeOutcome, ChallengeResponder,
        DeviceCredentialPrompter, FingerprintSensor,
    },
    PromptInfo,
};
use tracing::debug;

use crate::config::DeviceProfile;

const MAX_ATTEMPTS: u32 = 3;

/// Challenges answered on the controlling terminal. Stands in for the
/// platform prompts on hosts without a biometric service.
#[derive(Debug, Clone, Copy)]
pub struct TerminalAuthenticator {
    fingerprint_enrolled: bool,
    device_secure: bool,
}

impl TerminalAuthenticator {
    pub fn new(device: &DeviceProfile) -> Self {
        Self {
            fingerprint_enrolled: device.biometric_enrolled,
            device_secure: device.device_secure,
        }
    }

    fn spawn(
        &self,
        label: &'static str,
        prompt: PromptInfo,
        factor: AuthFactor,
        responder: ChallengeResponder,
    ) {
        // Stdin blocks; keep it off the runtime.
        thread::spawn(move || {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut output = io::stderr();
            converse(&mut input, &mut output, label, &prompt, factor, responder);
        });
    }
}

impl BiometricPrompter for TerminalAuthenticator {
    fn authenticate(&self, request: BiometricRequest, responder: ChallengeResponder) {
        debug!(
            allowed = ?request.allowed,
            crypto_bound = request.crypto_bound,
            "terminal biometric prompt"
        );
        let label = if request.allowed.device_credential {
            "biometric or password"
        } else {
            "biometric"
        };
        self.spawn(label, request.prompt, AuthFactor::BiometricStrong, responder);
    }
}

impl FingerprintSensor for TerminalAuthenticator {
    fn is_hardware_detected(&self) -> bool {
        true
    }

    fn has_enrolled_fingerprints(&self) -> bool {
        self.fingerprint_enrolled
    }

    fn authenticate(&self, responder: ChallengeResponder) {
        let prompt = PromptInfo {
            title: "Touch the fingerprint sensor".to_string(),
            ..PromptInfo::default()
        };
        self.spawn("fingerprint", prompt, AuthFactor::BiometricStrong, responder);
    }
}

impl DeviceCredentialPrompter for TerminalAuthenticator {
    fn is_device_secure(&self) -> bool {
        self.device_secure
    }

    fn confirm_credential(&self, prompt: &PromptInfo, responder: ChallengeResponder) {
        self.spawn("password", prompt.clone(), AuthFactor::DeviceCredential, responder);
    }
}

/// Ask until the user confirms, declines too often, cancels, or closes input.
fn converse(
    input: &mut impl BufRead,
    output: &mut impl Write,
    label: &str,
    prompt: &PromptInfo,
    factor: AuthFactor,
    responder: ChallengeResponder,
) {
    let _ = writeln!(output, "{} [{label}]", prompt.title);
    if let Some(subtitle) = &prompt.subtitle {
        let _ = writeln!(output, "{subtitle}");
    }
    if let Some(description) = &prompt.description {
        let _ = writeln!(output, "{description}");
    }

    let mut failures = 0;
    loop {
        let _ = write!(output, "Confirm? [y]es / [n]o / {}: ", prompt.negative_button);
        let _ = output.flush();

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return responder.resolve(ChallengeOutcome::SessionCanceled),
            Ok(_) => {}
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return responder.resolve(ChallengeOutcome::Authenticated(factor)),
            "n" | "no" => {
                failures += 1;
                if failures >= MAX_ATTEMPTS {
                    return responder.resolve(ChallengeOutcome::NoMatch);
                }
                responder.failed_attempt();
                let _ = writeln!(output, "Not recognized, try again.");
            }
            "" | "c" | "cancel" => return responder.resolve(ChallengeOutcome::UserCanceled),
            _ => {
                let _ = writeln!(output, "Please answer y, n or c.");
            }
        }
    }
}
