//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use usbguard_applet::bridge::{ControlPlane, PresenceSignal, Transport};
use usbguard_applet::relay::RawSignal;
use usbguard_applet::{Error, Result, Target};

/// Daemon rules for a root hub with a keyboard and a storage stick below it
pub const HUB: &str = r#"allow id 1d6b:0002 serial "0000:00:14.0" name "xHCI Host Controller" hash "hub" parent-hash "root" via-port "usb1" with-interface 09:00:00"#;
pub const KEYBOARD: &str = r#"allow id 046d:c31c serial "" name "USB Keyboard" hash "kbd" parent-hash "hub" via-port "1-1" with-interface { 03:01:01 03:00:00 }"#;
pub const STICK: &str = r#"block id 0781:5581 serial "4C530001230507110424" name "Ultra" hash "stick" parent-hash "hub" via-port "1-2" with-interface 08:06:50"#;

/// How mock requests fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The daemon vanished mid-request
    ConnectionLost,
    /// The daemon rejected the request
    Refused,
}

impl Failure {
    fn to_error(self) -> Error {
        match self {
            Self::ConnectionLost => Error::ConnectionLost("mock daemon gone".to_string()),
            Self::Refused => Error::Request("mock daemon refused".to_string()),
        }
    }
}

#[derive(Default)]
struct Shared {
    registered: bool,
    presence: Option<mpsc::UnboundedSender<PresenceSignal>>,
    signals: Option<mpsc::UnboundedSender<RawSignal>>,
    devices: Vec<(u32, String)>,
    applied: Vec<(u32, u32, bool)>,
    queries: Vec<String>,
    opens: usize,
    bus_open: bool,
    bus_opens: usize,
    fail_watch: bool,
    fail_open: bool,
    fail_requests: Option<Failure>,
}

/// In-memory stand-in for the message bus and daemon
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side control over a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

/// Create a transport whose daemon is not yet registered
pub fn mock() -> (MockTransport, MockHandle) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        MockTransport {
            shared: Arc::clone(&shared),
        },
        MockHandle { shared },
    )
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap()
}

impl Shared {
    /// Reuse the cached bus connection or open one
    fn bus(&mut self) {
        if !self.bus_open {
            self.bus_open = true;
            self.bus_opens += 1;
        }
    }
}

impl MockHandle {
    /// Mark the daemon registered without a presence signal
    pub fn set_registered(&self, registered: bool) {
        lock(&self.shared).registered = registered;
    }

    /// The daemon claims its name
    pub fn register(&self) {
        let mut shared = lock(&self.shared);
        shared.registered = true;
        if let Some(tx) = &shared.presence {
            let _ = tx.send(PresenceSignal::Registered);
        }
    }

    /// The daemon releases its name
    pub fn unregister(&self) {
        let mut shared = lock(&self.shared);
        shared.registered = false;
        if let Some(tx) = &shared.presence {
            let _ = tx.send(PresenceSignal::Unregistered);
        }
    }

    /// Close the presence watch
    pub fn end_presence(&self) {
        lock(&self.shared).presence = None;
    }

    /// Close the daemon notification stream
    pub fn end_signals(&self) {
        lock(&self.shared).signals = None;
    }

    /// Push a daemon notification
    pub fn emit(&self, signal: RawSignal) {
        if let Some(tx) = &lock(&self.shared).signals {
            let _ = tx.send(signal);
        }
    }

    pub fn presence(&self, id: u32, event: u32, rule: &str) {
        self.emit(RawSignal::PresenceChanged {
            id,
            event,
            target: Target::Allow.as_wire(),
            rule: rule.to_string(),
            attributes: HashMap::new(),
        });
    }

    pub fn policy_changed(&self, id: u32, old: Target, new: Target, rule: &str, rule_id: u32) {
        self.emit(RawSignal::PolicyChanged {
            id,
            target_old: old.as_wire(),
            target_new: new.as_wire(),
            rule: rule.to_string(),
            rule_id,
            attributes: HashMap::new(),
        });
    }

    /// Rules returned by `list_devices`
    pub fn set_devices(&self, devices: &[(u32, &str)]) {
        lock(&self.shared).devices = devices.iter().map(|(id, rule)| (*id, (*rule).to_string())).collect();
    }

    /// Make the presence watch fail as on a dead bus connection
    pub fn fail_watch(&self, fail: bool) {
        lock(&self.shared).fail_watch = fail;
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.shared).fail_open = fail;
    }

    pub fn fail_requests(&self, failure: Option<Failure>) {
        lock(&self.shared).fail_requests = failure;
    }

    /// `(id, wire target, permanent)` of every accepted apply request
    pub fn applied(&self) -> Vec<(u32, u32, bool)> {
        lock(&self.shared).applied.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.shared).queries.clone()
    }

    /// Number of control-plane handles opened
    pub fn opens(&self) -> usize {
        lock(&self.shared).opens
    }

    /// Number of bus connections opened
    pub fn bus_opens(&self) -> usize {
        lock(&self.shared).bus_opens
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn watch_presence(&mut self) -> Result<BoxStream<'static, PresenceSignal>> {
        let mut shared = lock(&self.shared);
        shared.bus();
        if shared.fail_watch {
            return Err(Error::ConnectionLost("mock bus connection closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.presence = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn is_registered(&mut self) -> Result<bool> {
        let mut shared = lock(&self.shared);
        shared.bus();
        Ok(shared.registered)
    }

    async fn open(&mut self) -> Result<Box<dyn ControlPlane>> {
        let mut shared = lock(&self.shared);
        shared.bus();
        shared.opens += 1;
        if shared.fail_open {
            return Err(Error::ConnectionLost("mock open refused".to_string()));
        }
        Ok(Box::new(MockControl {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn reset(&mut self) {
        lock(&self.shared).bus_open = false;
    }
}

struct MockControl {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl ControlPlane for MockControl {
    async fn list_devices(&self, query: &str) -> Result<Vec<(u32, String)>> {
        let mut shared = lock(&self.shared);
        shared.queries.push(query.to_string());
        if let Some(failure) = shared.fail_requests {
            return Err(failure.to_error());
        }
        Ok(shared.devices.clone())
    }

    async fn apply_device_policy(&self, id: u32, target: u32, permanent: bool) -> Result<u32> {
        let mut shared = lock(&self.shared);
        if let Some(failure) = shared.fail_requests {
            return Err(failure.to_error());
        }
        shared.applied.push((id, target, permanent));
        Ok(1000 + id)
    }

    async fn signals(&self) -> Result<BoxStream<'static, RawSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared).signals = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
