use std::{path::PathBuf, sync::Arc};

use bioseal_auth::{AuthDrivers, BiometricStorage, EngineConfig};
use bioseal_core::{
    auth::{BiometricApi, StaticCapabilities},
    observe::TracingObserver,
};
use bioseal_storage::key_provider::KeyringKeyStore;
use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;

use crate::{
    config::{Config, DeviceProfile},
    prompt::TerminalAuthenticator,
};

/// Resolve the default data directory for bioseal.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("bioseal"))
}

/// Build an engine backed by the OS keychain, with the terminal attached as host.
pub fn engine_from_config(config: &Config) -> Result<BiometricStorage<KeyringKeyStore>> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, service = config.keyring_service(), "initializing storage engine");

    let engine = BiometricStorage::new(
        EngineConfig {
            root,
            require_secure_element: config.require_secure_element,
            reset_policy: config.reset_policy,
        },
        Arc::new(KeyringKeyStore::new(config.keyring_service())),
        Arc::new(TracingObserver),
    );
    engine.attach_host(terminal_drivers(&config.device));
    Ok(engine)
}

pub fn capabilities(device: &DeviceProfile) -> StaticCapabilities {
    let capabilities = match device.biometric_api {
        BiometricApi::Modern => StaticCapabilities::modern(device.biometric_enrolled),
        BiometricApi::Legacy => StaticCapabilities::legacy(),
        BiometricApi::Unavailable => StaticCapabilities::unavailable(),
    };
    if device.device_secure {
        capabilities
    } else {
        capabilities.without_device_credential()
    }
}

fn terminal_drivers(device: &DeviceProfile) -> AuthDrivers {
    let terminal = Arc::new(TerminalAuthenticator::new(device));
    AuthDrivers {
        capabilities: Arc::new(capabilities(device)),
        biometric: terminal.clone(),
        fingerprint: terminal.clone(),
        credential: terminal,
    }
}

/// Helper for tests: an engine over a temp dir with in-memory keys and scripted prompts.
#[cfg(test)]
pub fn test_engine(
    root: impl Into<PathBuf>,
) -> BiometricStorage<bioseal_storage::key_provider::InMemoryKeyStore> {
    let engine = BiometricStorage::new(
        EngineConfig::new(root),
        Arc::new(bioseal_storage::key_provider::InMemoryKeyStore::new()),
        Arc::new(TracingObserver),
    );
    engine.attach_host(AuthDrivers::scripted(
        StaticCapabilities::modern(true),
        bioseal_core::auth::ScriptedAuthenticator::new(),
    ));
    engine
}
