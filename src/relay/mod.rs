//! Translation of raw daemon notifications into typed device events
//!
//! Nothing here holds state. Each [`RawSignal`] either becomes one
//! [`DeviceEvent`] or one [`RelayError`]; callers drop the failures and keep
//! going.

use std::collections::HashMap;

use thiserror::Error;

use crate::rule::{IMPLICIT_ID, Rule, RuleParseError, Target};

/// Opaque per-notification attribute map, carried but not interpreted
pub type Attributes = HashMap<String, String>;

/// Failure translating one notification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("unknown presence event code {0}")]
    UnknownPresenceEvent(u32),

    #[error("malformed rule for device {id}: {source}")]
    Rule {
        id: u32,
        #[source]
        source: RuleParseError,
    },
}

/// Notification payload exactly as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSignal {
    PolicyApplied {
        id: u32,
        target_new: u32,
        rule: String,
        rule_id: u32,
        attributes: Attributes,
    },
    PolicyChanged {
        id: u32,
        target_old: u32,
        target_new: u32,
        rule: String,
        rule_id: u32,
        attributes: Attributes,
    },
    PresenceChanged {
        id: u32,
        event: u32,
        target: u32,
        rule: String,
        attributes: Attributes,
    },
}

/// Physical device transition reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEvent {
    /// Already attached when the daemon started
    Present,
    Insert,
    Update,
    Remove,
}

impl PresenceEvent {
    /// Decode the daemon's wire value
    ///
    /// # Errors
    ///
    /// Returns error for codes outside the known range
    pub const fn from_wire(value: u32) -> Result<Self, RelayError> {
        match value {
            0 => Ok(Self::Present),
            1 => Ok(Self::Insert),
            2 => Ok(Self::Update),
            3 => Ok(Self::Remove),
            other => Err(RelayError::UnknownPresenceEvent(other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// Typed device notification
///
/// `id` is the daemon's device id, which is also the id the device's rule is
/// registered under. `rule_id` on policy events is the id of the rule that
/// produced the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A one-shot decision was executed
    PolicyApplied {
        id: u32,
        target: Target,
        rule: Rule,
        rule_id: u32,
    },
    /// A device's effective policy changed
    PolicyChanged {
        id: u32,
        old_target: Target,
        new_target: Target,
        rule: Rule,
        rule_id: u32,
    },
    /// A device was attached, detached or updated
    PresenceChanged {
        id: u32,
        event: PresenceEvent,
        target: Target,
        rule: Rule,
    },
}

impl DeviceEvent {
    /// Device id the event refers to
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        match self {
            Self::PolicyApplied { id, .. }
            | Self::PolicyChanged { id, .. }
            | Self::PresenceChanged { id, .. } => *id,
        }
    }

    #[must_use]
    pub const fn rule(&self) -> &Rule {
        match self {
            Self::PolicyApplied { rule, .. }
            | Self::PolicyChanged { rule, .. }
            | Self::PresenceChanged { rule, .. } => rule,
        }
    }

    /// Whether the daemon blocked a device by falling back to its implicit
    /// policy, as opposed to matching an authored rule
    #[must_use]
    pub const fn requires_decision(&self) -> bool {
        matches!(
            self,
            Self::PolicyChanged {
                new_target: Target::Block,
                rule_id: IMPLICIT_ID,
                ..
            }
        )
    }
}

/// Decode one raw notification
///
/// The embedded rule string takes the device id as its rule id so it can be
/// matched against the registry.
///
/// # Errors
///
/// Returns error if the rule string does not parse or the presence event code
/// is unknown
pub fn translate(signal: RawSignal) -> Result<DeviceEvent, RelayError> {
    let parse = |id: u32, rule: &str| {
        rule.parse::<Rule>()
            .map(|r| r.with_rule_id(id))
            .map_err(|source| RelayError::Rule { id, source })
    };

    match signal {
        RawSignal::PolicyApplied {
            id,
            target_new,
            rule,
            rule_id,
            attributes: _,
        } => Ok(DeviceEvent::PolicyApplied {
            id,
            target: Target::from_wire(target_new),
            rule: parse(id, &rule)?,
            rule_id,
        }),
        RawSignal::PolicyChanged {
            id,
            target_old,
            target_new,
            rule,
            rule_id,
            attributes: _,
        } => Ok(DeviceEvent::PolicyChanged {
            id,
            old_target: Target::from_wire(target_old),
            new_target: Target::from_wire(target_new),
            rule: parse(id, &rule)?,
            rule_id,
        }),
        RawSignal::PresenceChanged {
            id,
            event,
            target,
            rule,
            attributes: _,
        } => Ok(DeviceEvent::PresenceChanged {
            id,
            event: PresenceEvent::from_wire(event)?,
            target: Target::from_wire(target),
            rule: parse(id, &rule)?,
        }),
    }
}
