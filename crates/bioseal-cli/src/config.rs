use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use bioseal_auth::ResetPolicy;
use bioseal_core::{auth::BiometricApi, InitOptions, PromptInfo};
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/bioseal/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory holding encrypted payloads.
    pub data_dir: Option<PathBuf>,
    /// Keyring service name keys are stored under. Defaults to `bioseal-cli`.
    pub keyring_service: Option<String>,
    pub require_secure_element: bool,
    pub reset_policy: ResetPolicy,
    /// Prompt shown for every challenge.
    pub prompt: PromptInfo,
    pub device: DeviceProfile,
    /// Options for entries without their own `[entries.<name>]` table.
    pub defaults: InitOptions,
    pub entries: BTreeMap<String, InitOptions>,
}

impl Config {
    pub fn keyring_service(&self) -> &str {
        self.keyring_service.as_deref().unwrap_or("bioseal-cli")
    }

    pub fn options_for(&self, name: &str) -> InitOptions {
        self.entries
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// What this host can offer as authentication factors.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceProfile {
    pub biometric_api: BiometricApi,
    pub biometric_enrolled: bool,
    /// A device credential (login password) can be confirmed.
    pub device_secure: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            biometric_api: BiometricApi::Modern,
            biometric_enrolled: true,
            device_secure: true,
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("bioseal").join("config.toml"))
}

/// Write the config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
