//! Configuration management for the USBGuard applet
//!
//! Values resolve environment first, then the TOML file, then defaults.

pub mod file;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use file::AppletConfigFile;

use crate::bridge::DEFAULT_SETTLE_DELAY;
use crate::rule::Target;
use crate::{Error, Result};

/// Applet configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Daemon connection settings
    pub bridge: BridgeConfig,

    /// Which events produce notices
    pub notifications: NotificationSettings,

    /// Interactive decision defaults
    pub decision: DecisionSettings,
}

/// Message bus to find the daemon on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(Error::Config(format!("unknown bus {other:?}, expected system or session"))),
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::Session => "session",
        })
    }
}

/// Daemon connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Bus the daemon's service lives on
    pub bus: BusKind,

    /// Well-known service name
    pub service: String,

    /// Object path of the devices interface
    pub devices_path: String,

    /// Wait between service registration and connecting
    pub settle_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::System,
            service: "org.usbguard1".to_string(),
            devices_path: "/org/usbguard1/Devices".to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Per-event notice toggles
///
/// Activity log notices are always produced; these only control whether a
/// notice is marked for a desktop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct NotificationSettings {
    pub inserted: bool,
    pub removed: bool,
    pub present: bool,
    pub allowed: bool,
    pub blocked: bool,
    pub rejected: bool,
    /// Service connected and disconnected
    pub connection: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            inserted: true,
            removed: false,
            present: false,
            allowed: true,
            blocked: true,
            rejected: true,
            connection: false,
        }
    }
}

/// Time an implicitly blocked device waits for a decision
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(23);

/// Defaults for the decision prompt shown for implicitly blocked devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionSettings {
    /// Preselected answer
    pub default_target: Target,

    /// Persist the decision as a rule
    pub permanent: bool,

    /// Offer reject as a choice
    pub show_reject: bool,

    /// Hide every other character of the serial number
    pub mask_serial: bool,

    /// How long a request waits for an answer before the default applies
    pub timeout: Duration,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            default_target: Target::Block,
            permanent: false,
            show_reject: false,
            mask_serial: true,
            timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with environment values
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn resolve(fc: AppletConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let bus = env("USBGUARD_APPLET_BUS")
            .or(fc.bridge.bus)
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(defaults.bridge.bus);

        let service = env("USBGUARD_APPLET_SERVICE")
            .or(fc.bridge.service)
            .unwrap_or(defaults.bridge.service);

        let devices_path = fc.bridge.devices_path.unwrap_or(defaults.bridge.devices_path);

        let settle_delay = match env("USBGUARD_APPLET_SETTLE_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .map_err(|_| Error::Config(format!("USBGUARD_APPLET_SETTLE_MS is not a number: {v:?}")))?,
            ),
            None => fc
                .bridge
                .settle_delay_ms
                .map_or(defaults.bridge.settle_delay, Duration::from_millis),
        };

        let n = fc.notifications;
        let dn = defaults.notifications;
        let notifications = NotificationSettings {
            inserted: n.inserted.unwrap_or(dn.inserted),
            removed: n.removed.unwrap_or(dn.removed),
            present: n.present.unwrap_or(dn.present),
            allowed: n.allowed.unwrap_or(dn.allowed),
            blocked: n.blocked.unwrap_or(dn.blocked),
            rejected: n.rejected.unwrap_or(dn.rejected),
            connection: n.connection.unwrap_or(dn.connection),
        };

        let d = fc.decision;
        let dd = defaults.decision;
        let default_target = match d.default_target {
            Some(v) => {
                let target: Target = v.parse().map_err(|e| Error::Config(format!("decision.default_target: {e}")))?;
                if !target.is_actionable() {
                    return Err(Error::Config(format!(
                        "decision.default_target must be allow, block or reject, got {target}"
                    )));
                }
                target
            }
            None => dd.default_target,
        };
        let decision = DecisionSettings {
            default_target,
            permanent: d.permanent.unwrap_or(dd.permanent),
            show_reject: d.show_reject.unwrap_or(dd.show_reject),
            mask_serial: d.mask_serial.unwrap_or(dd.mask_serial),
            timeout: d.timeout_secs.map_or(dd.timeout, Duration::from_secs),
        };

        Ok(Self {
            bridge: BridgeConfig {
                bus,
                service,
                devices_path,
                settle_delay,
            },
            notifications,
            decision,
        })
    }
}
