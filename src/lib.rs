//! USBGuard applet - desktop-side mirror of the USBGuard device policy
//!
//! This library provides the non-visual core of a USBGuard client:
//! - Rule value type with the daemon's textual rule format
//! - Policy registry mirroring the daemon's device rule tree
//! - Session bridge tracking the daemon over D-Bus
//! - Monitor controller feeding one into the other and reporting activity
//! - Decision queue answering implicit blocks by a deadline
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 CLI / presentation                  │
//! │        watch  │  list  │  allow/block/reject        │
//! └────────────────────┬────────────────────────────────┘
//!                      │ Notice
//! ┌────────────────────▼────────────────────────────────┐
//! │                  PolicyMonitor                      │
//! │   PolicyRegistry  ◀── BridgeEvent ──  SessionBridge │
//! └────────────────────┬────────────────────────────────┘
//!                      │ Transport (zbus)
//! ┌────────────────────▼────────────────────────────────┐
//! │             usbguard-dbus (org.usbguard1)           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod decision;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod policy;
pub mod relay;
pub mod rule;

pub use bridge::{BridgeEvent, DbusTransport, SessionBridge, SessionState, Transport};
pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{CommitReport, Notice, NoticeKind, PolicyMonitor};
pub use policy::{NodeId, PolicyNode, PolicyRegistry, RegistryEvent};
pub use relay::{DeviceEvent, PresenceEvent};
pub use rule::{IMPLICIT_ID, Rule, Target};
