//! Rule targets and their wire encoding

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Decision attached to a rule
///
/// The discriminants are the daemon's wire encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Target {
    Allow = 0,
    Block = 1,
    Reject = 2,
    Match = 3,
    Unknown = 4,
    Device = 5,
    Empty = 6,
    Invalid = 7,
}

impl Target {
    /// All targets in wire order
    pub const ALL: [Self; 8] = [
        Self::Allow,
        Self::Block,
        Self::Reject,
        Self::Match,
        Self::Unknown,
        Self::Device,
        Self::Empty,
        Self::Invalid,
    ];

    /// Decode a wire value; anything out of range becomes `Invalid`
    #[must_use]
    pub const fn from_wire(value: u32) -> Self {
        match value {
            0 => Self::Allow,
            1 => Self::Block,
            2 => Self::Reject,
            3 => Self::Match,
            4 => Self::Unknown,
            5 => Self::Device,
            6 => Self::Empty,
            _ => Self::Invalid,
        }
    }

    /// Encode for the wire
    #[must_use]
    pub const fn as_wire(self) -> u32 {
        self as u32
    }

    /// Whether the daemon can apply this target to a device
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(self, Self::Allow | Self::Block | Self::Reject)
    }

    /// Keyword used in rule strings and config files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Reject => "reject",
            Self::Match => "match",
            Self::Unknown => "unknown",
            Self::Device => "device",
            Self::Empty => "empty",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a target keyword is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown target `{0}`")]
pub struct UnknownTarget(pub String);

impl FromStr for Target {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTarget(s.to_string()))
    }
}
