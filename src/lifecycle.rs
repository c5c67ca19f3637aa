//! Service lifecycle management
//!
//! Install, uninstall, and query the applet's `watch` loop as a systemd
//! user service. USBGuard is Linux-only, so other platforms get an error.

use std::path::PathBuf;

use crate::config::BusKind;
#[cfg(not(target_os = "linux"))]
use crate::Error;
use crate::Result;

/// Service status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Service is running
    Running,
    /// Service is installed but not running
    Stopped,
    /// Service is not installed
    NotInstalled,
    /// Status could not be determined
    Unknown(String),
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::NotInstalled => write!(f, "not installed"),
            Self::Unknown(msg) => write!(f, "unknown ({msg})"),
        }
    }
}

/// Service configuration
pub struct ServiceConfig {
    /// Path to the applet binary
    pub binary_path: PathBuf,
    /// Bus to look for the daemon on
    pub bus: BusKind,
    /// Extra arguments passed before the subcommand
    pub extra_args: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("usbguard-applet"),
            bus: BusKind::System,
            extra_args: Vec::new(),
        }
    }
}

const SYSTEMD_SERVICE: &str = "usbguard-applet";

/// Render the systemd user unit for `config`
#[must_use]
pub fn render_unit(config: &ServiceConfig) -> String {
    let mut args = config.extra_args.clone();
    if config.bus == BusKind::Session {
        args.push("--session-bus".to_string());
    }
    args.push("watch".to_string());

    format!(
        r"[Unit]
Description=USBGuard device policy monitor
After=dbus.socket

[Service]
Type=simple
ExecStart={binary} {args}
Restart=on-failure
RestartSec=5
Environment=RUST_LOG=info

[Install]
WantedBy=default.target
",
        binary = config.binary_path.display(),
        args = args.join(" "),
    )
}

/// Install the applet as a user service
///
/// # Errors
///
/// Returns error if service installation fails
pub fn install_service(config: &ServiceConfig) -> Result<()> {
    #[cfg(target_os = "linux")]
    return install_systemd(config);

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(Error::Service(
            "service installation not supported on this platform".to_string(),
        ))
    }
}

/// Uninstall the applet user service
///
/// # Errors
///
/// Returns error if service removal fails
pub fn uninstall_service() -> Result<()> {
    #[cfg(target_os = "linux")]
    return uninstall_systemd();

    #[cfg(not(target_os = "linux"))]
    Err(Error::Service(
        "service management not supported on this platform".to_string(),
    ))
}

/// Query applet service status
///
/// # Errors
///
/// Returns error if status cannot be determined
pub fn service_status() -> Result<ServiceStatus> {
    #[cfg(target_os = "linux")]
    return systemd_status();

    #[cfg(not(target_os = "linux"))]
    Ok(ServiceStatus::Unknown("platform not supported".to_string()))
}

/// Path of the installed unit file
#[must_use]
pub fn service_file_path() -> PathBuf {
    let config_dir = directories::BaseDirs::new().map_or_else(
        || {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        },
        |d| d.config_dir().to_path_buf(),
    );

    config_dir
        .join("systemd/user")
        .join(format!("{SYSTEMD_SERVICE}.service"))
}

#[cfg(target_os = "linux")]
fn install_systemd(config: &ServiceConfig) -> Result<()> {
    let path = service_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, render_unit(config))?;

    run_systemctl(&["--user", "daemon-reload"])?;
    run_systemctl(&["--user", "enable", "--now", SYSTEMD_SERVICE])?;

    tracing::info!(path = %path.display(), "installed systemd user service");
    Ok(())
}

#[cfg(target_os = "linux")]
fn uninstall_systemd() -> Result<()> {
    let _ = run_systemctl(&["--user", "disable", "--now", SYSTEMD_SERVICE]);

    let path = service_file_path();
    if path.exists() {
        std::fs::remove_file(&path)?;
        let _ = run_systemctl(&["--user", "daemon-reload"]);
        tracing::info!("uninstalled systemd user service");
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn systemd_status() -> Result<ServiceStatus> {
    if !service_file_path().exists() {
        return Ok(ServiceStatus::NotInstalled);
    }

    let output = std::process::Command::new("systemctl")
        .args(["--user", "is-active", SYSTEMD_SERVICE])
        .output()
        .map_err(|e| crate::Error::Service(format!("failed to run systemctl: {e}")))?;

    let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
    match status.as_str() {
        "active" => Ok(ServiceStatus::Running),
        "inactive" | "failed" => Ok(ServiceStatus::Stopped),
        other => Ok(ServiceStatus::Unknown(other.to_string())),
    }
}

#[cfg(target_os = "linux")]
fn run_systemctl(args: &[&str]) -> Result<()> {
    let output = std::process::Command::new("systemctl")
        .args(args)
        .output()
        .map_err(|e| crate::Error::Service(format!("failed to run systemctl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(crate::Error::Service(format!(
            "systemctl {} failed: {stderr}",
            args.join(" ")
        )));
    }

    Ok(())
}
