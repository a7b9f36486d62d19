//! Authentication-gated storage engine: picks the challenge factor, drives
//! cipher acquisition through at most one user challenge, and keeps the
//! registry of initialized entries.

pub mod challenge;
pub mod engine;
pub mod orchestrator;
pub mod registry;

pub use challenge::{AuthDrivers, ChallengeStrategy, Challenger};
pub use engine::{BiometricStorage, EngineConfig, ResetPolicy};
