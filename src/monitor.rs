//! Host controller tying the session bridge to the policy registry
//!
//! [`PolicyMonitor`] owns both halves and is the only writer of the
//! registry. It reacts to [`BridgeEvent`]s, keeps the registry in step with
//! the daemon, and reports what happened as [`Notice`]s on a channel for
//! whatever presents them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

use crate::bridge::{BridgeEvent, SessionBridge, Transport};
use crate::config::{Config, DecisionSettings, NotificationSettings};
use crate::policy::{PolicyRegistry, RegistryEvent};
use crate::relay::{DeviceEvent, PresenceEvent};
use crate::rule::{Rule, Target};
use crate::{Error, Result};

/// Query used to mirror every device the daemon knows about
pub const DEVICE_QUERY: &str = "match";

/// How loud a notice is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// What a notice is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// Service connected or disconnected
    Connection { connected: bool },
    /// A device was attached, detached or updated
    Presence { id: u32, event: PresenceEvent },
    /// A device's policy changed
    Policy { id: u32, target: Target },
    /// The daemon blocked a device by its implicit policy and is waiting
    /// for the user to decide
    DecisionRequired {
        id: u32,
        rule: Rule,
        /// Serial as it should be displayed
        serial: String,
    },
    /// A request to the daemon failed
    Failure,
}

/// Timestamped activity entry for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub at: DateTime<Local>,
    pub level: NoticeLevel,
    pub title: String,
    /// Device summary or error detail
    pub body: Option<String>,
    /// Whether the user asked to be notified about this kind of event
    pub notify: bool,
    pub kind: NoticeKind,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.title)?;
        if let Some(body) = &self.body {
            write!(f, ": {body}")?;
        }
        Ok(())
    }
}

/// Outcome of committing staged overrides
#[derive(Debug, Default)]
pub struct CommitReport {
    /// `(device id, resulting rule id)` for each accepted request
    pub applied: Vec<(u32, u32)>,
    /// Staged targets that cannot be sent to the daemon
    pub skipped: Vec<(u32, Target)>,
    /// Requests that failed, with the target that was attempted
    pub failed: Vec<(u32, Target, Error)>,
}

impl CommitReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Hide every other character of a serial, counting from its end
#[must_use]
pub fn mask_serial(serial: &str) -> String {
    let len = serial.chars().count();
    serial
        .chars()
        .enumerate()
        .map(|(i, c)| if (len - i) % 2 == 0 { '*' } else { c })
        .collect()
}

/// Single-owner controller for one daemon session
pub struct PolicyMonitor<T> {
    bridge: SessionBridge<T>,
    registry: PolicyRegistry,
    notifications: NotificationSettings,
    decision: DecisionSettings,
    retry_delay: Duration,
    notices: mpsc::UnboundedSender<Notice>,
}

impl<T: Transport> PolicyMonitor<T> {
    /// Create a monitor and the receiving end of its notice channel
    pub fn new(transport: T, config: &Config) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            bridge: SessionBridge::new(transport, config.bridge.settle_delay),
            registry: PolicyRegistry::new(),
            notifications: config.notifications,
            decision: config.decision,
            retry_delay: config.bridge.settle_delay,
            notices,
        };
        (monitor, rx)
    }

    #[must_use]
    pub const fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn bridge(&self) -> &SessionBridge<T> {
        &self.bridge
    }

    /// Receive registry change notifications
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Start watching for the daemon
    ///
    /// Returns whether the daemon is registered. An absent daemon is not an
    /// error; the presence watch picks it up when it appears.
    ///
    /// # Errors
    ///
    /// Returns error if the presence watch cannot be established
    pub async fn start(&mut self) -> Result<bool> {
        match self.bridge.try_connect().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.warn("Connection failed", Some("USBGuard service not available".to_string()));
                Ok(false)
            }
            Err(e) => {
                self.warn("Connection failed", Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for the next bridge event and process it
    pub async fn step(&mut self) {
        let event = self.next_event().await;
        self.process(event).await;
    }

    /// Wait for the next bridge event without acting on it
    ///
    /// Cancel safe, so hosts can select over it alongside other work and
    /// hand the result to [`Self::process`].
    pub async fn next_event(&mut self) -> Option<BridgeEvent> {
        self.bridge.next_event().await
    }

    /// Process an event from [`Self::next_event`]
    ///
    /// `None` means the presence watch has been lost: waits the retry delay
    /// and starts over.
    pub async fn process(&mut self, event: Option<BridgeEvent>) {
        if let Some(event) = event {
            self.handle(event).await;
            return;
        }

        tracing::debug!(delay_ms = self.retry_delay.as_millis(), "bridge idle, retrying");
        tokio::time::sleep(self.retry_delay).await;
        if let Err(e) = self.start().await {
            tracing::warn!(error = %e, "failed to re-establish presence watch");
        }
    }

    /// Apply one bridge event to the registry and report it
    pub async fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::ServiceAvailable => {
                self.connection_notice(true);
                if let Err(e) = self.load_device_list().await {
                    self.failure("listDevices", &e);
                }
            }
            BridgeEvent::ServiceUnavailable => {
                self.connection_notice(false);
                self.registry.clear();
            }
            BridgeEvent::Device(event) => self.handle_device(event).await,
        }
    }

    async fn handle_device(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PresenceChanged { id, event, rule, .. } => {
                tracing::trace!(id, event = event.as_str(), rule = %rule, "presence changed");
                match event {
                    PresenceEvent::Insert => {
                        if let Err(e) = self.load_device_list().await {
                            self.failure("listDevices", &e);
                        }
                    }
                    PresenceEvent::Remove => self.registry.remove(id),
                    PresenceEvent::Present | PresenceEvent::Update => {}
                }
                self.presence_notice(id, event, &rule);
            }
            DeviceEvent::PolicyChanged {
                id,
                new_target,
                ref rule,
                ..
            } => {
                tracing::trace!(id, %new_target, %rule, "policy changed");
                self.registry.update_target(id, new_target);
                self.policy_notice(id, new_target, rule);

                if event.requires_decision() {
                    let serial = self.display_serial(rule.serial());
                    tracing::info!(id, "device blocked by implicit policy, decision required");
                    self.emit(Notice {
                        at: Local::now(),
                        level: NoticeLevel::Warning,
                        title: "USB Device Requires Decision".to_string(),
                        body: Some(device_summary(rule)),
                        notify: true,
                        kind: NoticeKind::DecisionRequired {
                            id,
                            rule: rule.clone(),
                            serial,
                        },
                    });
                }
            }
            DeviceEvent::PolicyApplied { id, target, rule_id, .. } => {
                tracing::debug!(id, %target, rule_id, "policy applied");
            }
        }
    }

    /// Mirror every device the daemon knows about
    ///
    /// Returns the number of newly inserted rules.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the query fails
    pub async fn load_device_list(&mut self) -> Result<usize> {
        self.load_devices(DEVICE_QUERY).await
    }

    /// Insert the devices matching `query` that are not already held
    ///
    /// Malformed rules are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the query fails
    pub async fn load_devices(&mut self, query: &str) -> Result<usize> {
        let devices = self.bridge.list_devices(query).await?;
        let mut inserted = 0;

        for (id, rule) in devices {
            match rule.parse::<Rule>() {
                Ok(rule) if !self.registry.contains(id) => {
                    self.registry.insert(rule.with_rule_id(id));
                    inserted += 1;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(id, error = %e, "skipping malformed device rule"),
            }
        }

        tracing::debug!(query, inserted, total = self.registry.len(), "device list loaded");
        Ok(inserted)
    }

    /// Drop the mirrored state and load it afresh
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the query fails
    pub async fn reset_device_list(&mut self) -> Result<usize> {
        self.registry.clear();
        self.load_device_list().await
    }

    /// Stage an override for a device, returning whether anything changed
    pub fn stage(&mut self, id: u32, target: Target) -> bool {
        self.registry.stage(id, target)
    }

    /// Staged overrides awaiting commit
    #[must_use]
    pub fn modified(&self) -> BTreeMap<u32, Target> {
        self.registry.modified()
    }

    /// Send every staged override to the daemon
    ///
    /// Failures are collected rather than aborting the batch. Staged state
    /// is reconciled when the daemon echoes the resulting policy change.
    pub async fn commit(&mut self, permanent: bool) -> CommitReport {
        let mut report = CommitReport::default();

        for (id, target) in self.registry.modified() {
            if !target.is_actionable() {
                tracing::debug!(id, %target, "skipping non-actionable staged target");
                report.skipped.push((id, target));
                continue;
            }

            match self.bridge.apply_device_policy(id, target, permanent).await {
                Ok(rule_id) => report.applied.push((id, rule_id)),
                Err(e) => {
                    self.failure("applyDevicePolicy", &e);
                    report.failed.push((id, target, e));
                }
            }
        }

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "committed staged targets"
        );
        report
    }

    /// Apply a target to one device right away
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the daemon refuses
    pub async fn apply(&mut self, id: u32, target: Target, permanent: bool) -> Result<u32> {
        self.bridge.apply_device_policy(id, target, permanent).await
    }

    /// # Errors
    ///
    /// See [`Self::apply`]
    pub async fn allow(&mut self, id: u32, permanent: bool) -> Result<u32> {
        self.apply(id, Target::Allow, permanent).await
    }

    /// # Errors
    ///
    /// See [`Self::apply`]
    pub async fn block(&mut self, id: u32, permanent: bool) -> Result<u32> {
        self.apply(id, Target::Block, permanent).await
    }

    /// # Errors
    ///
    /// See [`Self::apply`]
    pub async fn reject(&mut self, id: u32, permanent: bool) -> Result<u32> {
        self.apply(id, Target::Reject, permanent).await
    }

    fn display_serial(&self, serial: &str) -> String {
        if self.decision.mask_serial {
            mask_serial(serial)
        } else {
            serial.to_string()
        }
    }

    fn connection_notice(&self, connected: bool) {
        let (title, level) = if connected {
            ("USBGuard Connection Established", NoticeLevel::Info)
        } else {
            ("USBGuard Connection Lost", NoticeLevel::Warning)
        };
        self.emit(Notice {
            at: Local::now(),
            level,
            title: title.to_string(),
            body: None,
            notify: self.notifications.connection,
            kind: NoticeKind::Connection { connected },
        });
    }

    fn presence_notice(&self, id: u32, event: PresenceEvent, rule: &Rule) {
        let n = self.notifications;
        let (title, notify) = match event {
            PresenceEvent::Insert => ("USB Device Inserted", n.inserted),
            PresenceEvent::Update => ("USB Device Updated", true),
            PresenceEvent::Remove => ("USB Device Removed", n.removed),
            PresenceEvent::Present => ("USB Device Present", n.present),
        };
        self.emit(Notice {
            at: Local::now(),
            level: NoticeLevel::Info,
            title: title.to_string(),
            body: Some(device_summary(rule)),
            notify,
            kind: NoticeKind::Presence { id, event },
        });
    }

    fn policy_notice(&self, id: u32, target: Target, rule: &Rule) {
        let n = self.notifications;
        let (title, notify, level) = match target {
            Target::Allow => ("USB Device Allowed", n.allowed, NoticeLevel::Info),
            Target::Block => ("USB Device Blocked", n.blocked, NoticeLevel::Warning),
            Target::Reject => ("USB Device Rejected", n.rejected, NoticeLevel::Warning),
            _ => return,
        };
        self.emit(Notice {
            at: Local::now(),
            level,
            title: title.to_string(),
            body: Some(device_summary(rule)),
            notify,
            kind: NoticeKind::Policy { id, target },
        });
    }

    fn failure(&self, call: &str, err: &Error) {
        tracing::warn!(call, error = %err, "daemon request failed");
        self.warn("D-Bus call failed", Some(format!("{call}: {err}")));
    }

    fn warn(&self, title: &str, body: Option<String>) {
        self.emit(Notice {
            at: Local::now(),
            level: NoticeLevel::Warning,
            title: title.to_string(),
            body,
            notify: false,
            kind: NoticeKind::Failure,
        });
    }

    fn emit(&self, notice: Notice) {
        // Nobody listening is fine
        let _ = self.notices.send(notice);
    }
}

fn device_summary(rule: &Rule) -> String {
    let usb_id = rule.device_id().map(ToString::to_string).unwrap_or_default();
    format!("USB ID={usb_id}; Name={}; Port={}", rule.name(), rule.via_port())
}
