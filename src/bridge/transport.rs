//! Seams between the session state machine and the message bus

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;
use crate::relay::RawSignal;

/// Change in the daemon's bus name ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceSignal {
    /// The service name gained an owner
    Registered,
    /// The service name lost its owner
    Unregistered,
}

/// Message bus access needed to discover and reach the daemon
#[async_trait]
pub trait Transport: Send {
    /// Subscribe to registration changes of the daemon's service name
    ///
    /// The stream ending means the watch is lost.
    async fn watch_presence(&mut self) -> Result<BoxStream<'static, PresenceSignal>>;

    /// Whether the service name currently has an owner
    async fn is_registered(&mut self) -> Result<bool>;

    /// Open the control-plane handle for the daemon's device object
    async fn open(&mut self) -> Result<Box<dyn ControlPlane>>;

    /// Forget any cached bus connection
    ///
    /// Called when the presence watch is lost or cannot be established, so
    /// the next attempt starts from a fresh connection.
    fn reset(&mut self) {}
}

/// Request/response and notification surface of a connected daemon
///
/// Requests that fail because the daemon went away must report
/// [`crate::Error::ConnectionLost`] so the session can tear down.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Query device rules matching `query`, as `(rule_id, rule_string)`
    async fn list_devices(&self, query: &str) -> Result<Vec<(u32, String)>>;

    /// Apply a target to a device, returning the id of the resulting rule
    async fn apply_device_policy(&self, id: u32, target: u32, permanent: bool) -> Result<u32>;

    /// Subscribe to the daemon's three device notifications, merged in
    /// arrival order
    async fn signals(&self) -> Result<BoxStream<'static, RawSignal>>;
}
