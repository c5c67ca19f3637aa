//! TOML configuration file loading
//!
//! Supports `~/.config/usbguard-applet/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AppletConfigFile {
    /// Daemon connection settings
    #[serde(default)]
    pub bridge: BridgeFileConfig,

    /// Which events produce desktop notices
    #[serde(default)]
    pub notifications: NotificationsFileConfig,

    /// Interactive decision prompt defaults
    #[serde(default)]
    pub decision: DecisionFileConfig,
}

/// Daemon connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    /// "system" or "session"
    pub bus: Option<String>,

    /// Well-known service name (e.g. "org.usbguard1")
    pub service: Option<String>,

    /// Object path of the devices interface
    pub devices_path: Option<String>,

    /// Delay after the service registers before connecting
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsFileConfig {
    pub inserted: Option<bool>,
    pub removed: Option<bool>,
    pub present: Option<bool>,
    pub allowed: Option<bool>,
    pub blocked: Option<bool>,
    pub rejected: Option<bool>,
    pub connection: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionFileConfig {
    /// "allow", "block" or "reject"
    pub default_target: Option<String>,

    /// Persist decisions as rules
    pub permanent: Option<bool>,

    /// Offer reject alongside allow and block
    pub show_reject: Option<bool>,

    /// Hide every other character of device serials
    pub mask_serial: Option<bool>,

    /// Seconds before an unanswered prompt applies the default
    pub timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `AppletConfigFile::default()` if the file doesn't exist or can't
/// be parsed.
pub fn load_config_file() -> AppletConfigFile {
    config_file_path().map_or_else(AppletConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, with the same fallbacks
pub fn load_from(path: &Path) -> AppletConfigFile {
    if !path.exists() {
        return AppletConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                AppletConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            AppletConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/usbguard-applet/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("usbguard-applet").join("config.toml"))
}
