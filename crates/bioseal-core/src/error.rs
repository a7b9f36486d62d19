use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the engine can surface to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A required call argument was absent or empty.
    MissingArgument,
    /// The entry was never initialized (or was disposed).
    NotInitialized,
    /// `init` with `force` hit an existing registration.
    AlreadyInitialized,
    /// The key store could not create a key for the entry.
    KeyProvisioning,
    /// The platform revoked the key. Handled internally with one reset-and-retry.
    KeyInvalidated,
    /// The user dismissed the prompt.
    AuthChallengeCanceled,
    /// The platform or session canceled the prompt.
    AuthSessionCanceled,
    AuthChallengeTimeout,
    /// The platform gave up after too many unrecognized attempts.
    AuthChallengeFailedNoMatch,
    /// No authentication factor is usable on this device.
    AuthUnavailable,
    /// Terminal: the host should delete and reinitialize the entry.
    ResetRequired,
    Io,
    Decryption,
    Unexpected,
}

impl ErrorKind {
    /// Stable code handed to hosts. Never change an existing value.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::MissingArgument => "MissingArgument",
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::AlreadyInitialized => "AlreadyInitialized",
            ErrorKind::KeyProvisioning => "KeyProvisioning",
            ErrorKind::KeyInvalidated => "KeyInvalidated",
            ErrorKind::AuthChallengeCanceled => "AuthError:UserCanceled",
            ErrorKind::AuthSessionCanceled => "AuthError:Canceled",
            ErrorKind::AuthChallengeTimeout => "AuthError:Timeout",
            ErrorKind::AuthChallengeFailedNoMatch => "AuthError:Failed",
            ErrorKind::AuthUnavailable => "AuthError:Unavailable",
            ErrorKind::ResetRequired => "AuthError:ResetBiometrics",
            ErrorKind::Io => "IOError",
            ErrorKind::Decryption => "DecryptionError",
            ErrorKind::Unexpected => "UnexpectedError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured error returned across the engine boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Optional diagnostic context (source chain, offending path, ...).
    pub details: Option<String>,
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn missing_argument(name: &str) -> Self {
        Self::new(
            ErrorKind::MissingArgument,
            format!("Missing required argument '{name}'"),
        )
    }

    pub fn not_initialized(name: &str) -> Self {
        Self::new(
            ErrorKind::NotInitialized,
            format!("Storage {name} was not initialized."),
        )
    }

    pub fn reset_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResetRequired, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

/// Serializable `{code, message, details}` record for hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}
