//! Device identity and interface descriptors used in rules

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::RuleParseError;

/// Vendor/product identity pair, `*` meaning any
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId {
    vendor: String,
    product: String,
}

impl DeviceId {
    /// Create a device id from its two components
    ///
    /// # Errors
    ///
    /// Returns error if a component is neither `*` nor four hex digits, or
    /// if a wildcard vendor is paired with a concrete product
    pub fn new(vendor: &str, product: &str) -> Result<Self, RuleParseError> {
        let invalid = || RuleParseError::InvalidDeviceId(format!("{vendor}:{product}"));

        if !is_id_component(vendor) || !is_id_component(product) {
            return Err(invalid());
        }
        if vendor == "*" && product != "*" {
            return Err(invalid());
        }

        Ok(Self {
            vendor: vendor.to_ascii_lowercase(),
            product: product.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }
}

fn is_id_component(s: &str) -> bool {
    s == "*" || (s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit()))
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.product)
    }
}

impl FromStr for DeviceId {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .split_once(':')
            .ok_or_else(|| RuleParseError::InvalidDeviceId(s.to_string()))?;
        Self::new(vendor, product)
    }
}

/// USB interface class/subclass/protocol triple
///
/// `None` in subclass or protocol is the `*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InterfaceType {
    pub class: u8,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

impl InterfaceType {
    #[must_use]
    pub const fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass: Some(subclass),
            protocol: Some(protocol),
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:", self.class)?;
        match self.subclass {
            Some(v) => write!(f, "{v:02x}:")?,
            None => f.write_str("*:")?,
        }
        match self.protocol {
            Some(v) => write!(f, "{v:02x}"),
            None => f.write_str("*"),
        }
    }
}

impl FromStr for InterfaceType {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RuleParseError::InvalidInterface(s.to_string());
        let mut parts = s.split(':');
        let (Some(class), Some(subclass), Some(protocol), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let byte = |p: &str| {
            if p.len() == 2 {
                u8::from_str_radix(p, 16).ok()
            } else {
                None
            }
        };
        let wildcard = |p: &str| if p == "*" { Some(None) } else { byte(p).map(Some) };

        let class = byte(class).ok_or_else(invalid)?;
        let subclass = wildcard(subclass).ok_or_else(invalid)?;
        let protocol = wildcard(protocol).ok_or_else(invalid)?;

        // A concrete protocol under a wildcard subclass is meaningless
        if subclass.is_none() && protocol.is_some() {
            return Err(invalid());
        }

        Ok(Self {
            class,
            subclass,
            protocol,
        })
    }
}

/// Set operator prefixing a multi-valued attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetOperator {
    AllOf,
    OneOf,
    NoneOf,
    Equals,
    EqualsOrdered,
    MatchAll,
}

impl SetOperator {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllOf => "all-of",
            Self::OneOf => "one-of",
            Self::NoneOf => "none-of",
            Self::Equals => "equals",
            Self::EqualsOrdered => "equals-ordered",
            Self::MatchAll => "match-all",
        }
    }

    pub(crate) fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "all-of" => Some(Self::AllOf),
            "one-of" => Some(Self::OneOf),
            "none-of" => Some(Self::NoneOf),
            "equals" => Some(Self::Equals),
            "equals-ordered" => Some(Self::EqualsOrdered),
            "match-all" => Some(Self::MatchAll),
            _ => None,
        }
    }
}

/// A possibly multi-valued rule attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute<T> {
    pub operator: Option<SetOperator>,
    pub values: Vec<T>,
}

impl<T> Default for Attribute<T> {
    fn default() -> Self {
        Self {
            operator: None,
            values: Vec::new(),
        }
    }
}

impl<T> Attribute<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<T: fmt::Display> Attribute<T> {
    /// Render as it appears after the attribute keyword
    pub(crate) fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.operator, self.values.as_slice()) {
            (None, [single]) => write!(f, "{single}"),
            (operator, values) => {
                if let Some(op) = operator {
                    write!(f, "{} ", op.as_str())?;
                }
                f.write_str("{")?;
                for value in values {
                    write!(f, " {value}")?;
                }
                f.write_str(" }")
            }
        }
    }
}
