//! Registry node types

use std::fmt;

use crate::rule::{Rule, Target};

/// Stable handle to a node in a [`super::PolicyRegistry`]
///
/// Handles are generation-checked: once a node is removed its handle stops
/// resolving, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A rule held by the registry, with its staged override and tree links
#[derive(Debug, Clone)]
pub struct PolicyNode {
    pub(crate) id: NodeId,
    pub(crate) rule: Rule,
    pub(crate) requested_target: Target,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

impl PolicyNode {
    pub(crate) fn new(id: NodeId, rule: Rule, parent: Option<NodeId>) -> Self {
        Self {
            id,
            requested_target: rule.target(),
            rule,
            parent,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn rule(&self) -> &Rule {
        &self.rule
    }

    #[must_use]
    pub const fn rule_id(&self) -> u32 {
        self.rule.rule_id()
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        self.rule.hash()
    }

    /// Last target confirmed by the daemon
    #[must_use]
    pub const fn target(&self) -> Target {
        self.rule.target()
    }

    /// Target the user wants; differs from [`Self::target`] while staged
    #[must_use]
    pub const fn requested_target(&self) -> Target {
        self.requested_target
    }

    /// Whether an override is staged but not committed
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.requested_target != self.rule.target()
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Change notification emitted by the registry, in mutation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A node was created
    Inserted {
        node: NodeId,
        rule_id: u32,
        parent: Option<NodeId>,
    },
    /// An existing node's rule was overwritten by a rule with the same hash
    Replaced { node: NodeId, rule_id: u32 },
    /// A node was destroyed
    Removed { rule_id: u32, hash: String },
    /// The daemon confirmed a new target
    TargetChanged {
        node: NodeId,
        rule_id: u32,
        previous: Target,
        target: Target,
    },
    /// The user staged a different target
    RequestedTargetChanged {
        node: NodeId,
        rule_id: u32,
        requested: Target,
    },
    /// The whole forest was dropped
    Cleared,
}
