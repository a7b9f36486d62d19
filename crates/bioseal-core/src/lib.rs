//! Core contracts for bioseal: the error taxonomy, entry options, and the
//! capability traits through which the engine talks to platform authenticators.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod auth;
pub mod error;
pub mod observe;
pub mod options;

pub use error::{ErrorKind, ErrorPayload, StorageError, StorageResult};
pub use options::{CipherMode, InitOptions, PromptInfo};
