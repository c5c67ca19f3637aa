//! Device authorization rules
//!
//! A [`Rule`] is a value object decoded from the daemon's canonical rule
//! string. It is replaced rather than edited; the only in-place changes are
//! assigning the rule id at insertion and updating the target when the
//! daemon confirms a new decision.

mod device;
mod parse;
mod target;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use device::{Attribute, DeviceId, InterfaceType, SetOperator};
pub use parse::RuleParseError;
pub use target::{Target, UnknownTarget};

/// Rule id the daemon assigns to rules synthesized from its implicit policy
pub const IMPLICIT_ID: u32 = u32::MAX - 1;

/// One device authorization rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    rule_id: u32,
    target: Target,
    device_id: Option<DeviceId>,
    name: String,
    serial: String,
    via_port: String,
    hash: String,
    parent_hash: String,
    connect_type: String,
    label: String,
    interface_types: Attribute<InterfaceType>,
}

impl Rule {
    /// Create an empty rule with the given target
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            rule_id: 0,
            target,
            device_id: None,
            name: String::new(),
            serial: String::new(),
            via_port: String::new(),
            hash: String::new(),
            parent_hash: String::new(),
            connect_type: String::new(),
            label: String::new(),
            interface_types: Attribute::default(),
        }
    }

    #[must_use]
    pub const fn rule_id(&self) -> u32 {
        self.rule_id
    }

    #[must_use]
    pub const fn target(&self) -> Target {
        self.target
    }

    #[must_use]
    pub const fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    #[must_use]
    pub fn via_port(&self) -> &str {
        &self.via_port
    }

    /// Content fingerprint assigned by the daemon
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Fingerprint of the rule this one derives from; empty for roots
    #[must_use]
    pub fn parent_hash(&self) -> &str {
        &self.parent_hash
    }

    #[must_use]
    pub fn connect_type(&self) -> &str {
        &self.connect_type
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub const fn interface_types(&self) -> &Attribute<InterfaceType> {
        &self.interface_types
    }

    /// Whether this rule came from the daemon's implicit policy
    #[must_use]
    pub const fn is_implicit(&self) -> bool {
        self.rule_id == IMPLICIT_ID
    }

    #[must_use]
    pub fn with_rule_id(mut self, rule_id: u32) -> Self {
        self.rule_id = rule_id;
        self
    }

    /// Copy of this rule with another target, used for staging overrides
    #[must_use]
    pub fn with_target(&self, target: Target) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    #[must_use]
    pub fn with_via_port(mut self, via_port: impl Into<String>) -> Self {
        self.via_port = via_port.into();
        self
    }

    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    #[must_use]
    pub fn with_parent_hash(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = parent_hash.into();
        self
    }

    #[must_use]
    pub fn with_interfaces(mut self, interfaces: Attribute<InterfaceType>) -> Self {
        self.interface_types = interfaces;
        self
    }

    pub(crate) const fn set_target(&mut self, target: Target) {
        self.target = target;
    }
}

impl FromStr for Rule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_rule(s)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target.as_str())?;

        if let Some(id) = &self.device_id {
            write!(f, " id {id}")?;
        }

        let strings = [
            ("serial", &self.serial),
            ("name", &self.name),
            ("hash", &self.hash),
            ("parent-hash", &self.parent_hash),
            ("via-port", &self.via_port),
        ];
        for (keyword, value) in strings {
            if !value.is_empty() {
                write!(f, " {keyword} {}", parse::quote(value))?;
            }
        }

        if self.interface_types.operator.is_some() || !self.interface_types.is_empty() {
            f.write_str(" with-interface ")?;
            self.interface_types.render(f)?;
        }

        for (keyword, value) in [("with-connect-type", &self.connect_type), ("label", &self.label)] {
            if !value.is_empty() {
                write!(f, " {keyword} {}", parse::quote(value))?;
            }
        }

        Ok(())
    }
}
