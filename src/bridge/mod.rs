//! Daemon session lifecycle
//!
//! [`SessionBridge`] watches the daemon's bus name, opens the control-plane
//! handle once the daemon is ready, and relays its notifications as
//! [`BridgeEvent`]s. The presence watch outlives any single connection, so a
//! daemon restart is picked up without intervention.
//!
//! ```text
//!  Idle ──try_connect──▶ Watching ──registered──▶ Settling ──delay──▶ Connected
//!                           ▲                        │                   │
//!                           └──────unregistered──────┴───────────────────┘
//! ```

mod dbus;
mod transport;

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::time::Instant;

pub use dbus::{DbusTransport, DevicesProxy};
pub use transport::{ControlPlane, PresenceSignal, Transport};

use crate::relay::{self, DeviceEvent, RawSignal};
use crate::rule::Target;
use crate::{Error, Result};

/// Delay between the daemon claiming its bus name and it answering requests
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Connection state of a [`SessionBridge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No presence watch established
    Idle,
    /// Watching for the daemon, no connection open
    Watching,
    /// The daemon registered; waiting out the settle delay
    SettlingAfterRegistration,
    /// Control-plane handle open and notifications subscribed
    Connected,
}

/// Event delivered to the bridge's owner, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The control-plane connection was established
    ServiceAvailable,
    /// The control-plane connection was torn down
    ServiceUnavailable,
    /// A daemon notification
    Device(DeviceEvent),
}

enum Wakeup {
    Presence(Option<PresenceSignal>),
    Settled,
    Signal(Option<RawSignal>),
}

/// Session state machine over a [`Transport`]
///
/// The bridge is driven entirely by its owner: state only advances inside
/// [`Self::try_connect`], [`Self::next_event`] and the request methods, so a
/// single task owns both the bridge and whatever it feeds.
pub struct SessionBridge<T> {
    transport: T,
    settle_delay: Duration,
    state: SessionState,
    presence: Option<BoxStream<'static, PresenceSignal>>,
    settle_deadline: Option<Instant>,
    control: Option<Box<dyn ControlPlane>>,
    signals: Option<BoxStream<'static, RawSignal>>,
    pending: VecDeque<BridgeEvent>,
}

impl<T: Transport> SessionBridge<T> {
    /// Create an idle bridge
    pub fn new(transport: T, settle_delay: Duration) -> Self {
        Self {
            transport,
            settle_delay,
            state: SessionState::Idle,
            presence: None,
            settle_deadline: None,
            control: None,
            signals: None,
            pending: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected)
    }

    /// Establish the presence watch if needed and check the daemon
    ///
    /// A daemon that is already registered is connected to right away; it
    /// has been up long enough that the settle delay does not apply.
    /// Returns whether the daemon is currently registered.
    ///
    /// # Errors
    ///
    /// Returns error if the watch cannot be established or the registration
    /// check fails.
    /// The bridge is left idle and the transport reset, ready for a retry.
    pub async fn try_connect(&mut self) -> Result<bool> {
        if self.presence.is_none() {
            let presence = self
                .transport
                .watch_presence()
                .await
                .inspect_err(|_| self.transport.reset())?;
            self.presence = Some(presence);
            self.state = SessionState::Watching;
            tracing::debug!("presence watch established");
        }

        let registered = match self.transport.is_registered().await {
            Ok(registered) => registered,
            Err(e) => {
                self.presence = None;
                self.teardown("registration check failed");
                self.transport.reset();
                return Err(e);
            }
        };
        tracing::debug!(registered, "checked service registration");
        if registered && self.state == SessionState::Watching {
            self.connect().await;
        }
        Ok(registered)
    }

    /// Wait for the next event, advancing the state machine as needed
    ///
    /// Returns `None` once the bridge is idle, i.e. the presence watch was
    /// never established or has been lost; call [`Self::try_connect`] to
    /// start over.
    ///
    /// Cancel safe: events not yet returned stay queued.
    pub async fn next_event(&mut self) -> Option<BridgeEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let presence = self.presence.as_mut()?;
            let deadline = self.settle_deadline;
            let signals = self.signals.as_mut();

            let wakeup = tokio::select! {
                biased;
                signal = presence.next() => Wakeup::Presence(signal),
                raw = next_signal(signals) => Wakeup::Signal(raw),
                () = settled(deadline) => Wakeup::Settled,
            };

            match wakeup {
                Wakeup::Presence(Some(signal)) => self.on_presence(signal),
                Wakeup::Presence(None) => {
                    tracing::warn!("presence watch ended");
                    self.presence = None;
                    self.teardown("presence watch lost");
                    self.transport.reset();
                }
                Wakeup::Settled => self.connect().await,
                Wakeup::Signal(Some(raw)) => match relay::translate(raw) {
                    Ok(event) => self.pending.push_back(BridgeEvent::Device(event)),
                    Err(e) => tracing::warn!(error = %e, "dropping daemon notification"),
                },
                Wakeup::Signal(None) => self.teardown("notification stream ended"),
            }
        }
    }

    /// Query the daemon's device rules
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without blocking if no connection is
    /// open, or the request failure. A lost connection also tears the
    /// session down.
    pub async fn list_devices(&mut self, query: &str) -> Result<Vec<(u32, String)>> {
        let control = self.control.as_ref().ok_or(Error::NotConnected)?;
        let result = control.list_devices(query).await;
        self.check(result)
    }

    /// Apply a target to a device, returning the resulting rule id
    ///
    /// # Errors
    ///
    /// Same as [`Self::list_devices`]
    pub async fn apply_device_policy(&mut self, id: u32, target: Target, permanent: bool) -> Result<u32> {
        let control = self.control.as_ref().ok_or(Error::NotConnected)?;
        tracing::debug!(id, %target, permanent, "apply device policy");
        let result = control.apply_device_policy(id, target.as_wire(), permanent).await;
        self.check(result)
    }

    fn check<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_connection_lost() {
                self.teardown("request lost its connection");
            }
        }
        result
    }

    fn on_presence(&mut self, signal: PresenceSignal) {
        match (signal, self.state) {
            (PresenceSignal::Registered, SessionState::Watching | SessionState::SettlingAfterRegistration) => {
                tracing::debug!(delay_ms = self.settle_delay.as_millis(), "service registered, settling");
                self.settle_deadline = Some(Instant::now() + self.settle_delay);
                self.state = SessionState::SettlingAfterRegistration;
            }
            (PresenceSignal::Unregistered, SessionState::SettlingAfterRegistration | SessionState::Connected) => {
                self.teardown("service unregistered");
            }
            (signal, state) => tracing::debug!(?signal, ?state, "presence signal ignored"),
        }
    }

    async fn connect(&mut self) {
        // The deadline stays armed until the attempt finishes, so a cancelled
        // attempt is retried on the next call
        let opened: Result<_> = async {
            let control = self.transport.open().await?;
            let signals = control.signals().await?;
            Ok((control, signals))
        }
        .await;
        self.settle_deadline = None;

        match opened {
            Ok((control, signals)) => {
                self.control = Some(control);
                self.signals = Some(signals);
                self.state = SessionState::Connected;
                tracing::info!("connected to USBGuard service");
                self.pending.push_back(BridgeEvent::ServiceAvailable);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open control plane");
                self.state = SessionState::Watching;
            }
        }
    }

    /// Drop the connection and any pending settle timer
    ///
    /// Only a session that was connected reports `ServiceUnavailable`.
    fn teardown(&mut self, reason: &str) {
        self.settle_deadline = None;
        self.signals = None;
        let was_connected = self.control.take().is_some();

        self.state = if self.presence.is_some() {
            SessionState::Watching
        } else {
            SessionState::Idle
        };

        if was_connected {
            tracing::info!(reason, "USBGuard service unavailable");
            self.pending.push_back(BridgeEvent::ServiceUnavailable);
        } else {
            tracing::debug!(reason, "settling cancelled");
        }
    }
}

async fn settled(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_signal(signals: Option<&mut BoxStream<'static, RawSignal>>) -> Option<RawSignal> {
    match signals {
        Some(signals) => signals.next().await,
        None => std::future::pending().await,
    }
}
