//! Error types for the USBGuard applet

use thiserror::Error;

/// Result type alias for applet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the applet
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Control-plane call attempted while no connection is open
    #[error("not connected to the USBGuard service")]
    NotConnected,

    /// The connection dropped while a request was in flight
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The daemon answered a request with an error
    #[error("request failed: {0}")]
    Request(String),

    /// Transport-level D-Bus error
    #[error("dbus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Service installation error
    #[error("service error: {0}")]
    Service(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the control-plane connection is gone
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}
