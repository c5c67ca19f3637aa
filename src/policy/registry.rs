//! Hierarchical rule registry indexed by content hash and rule id

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tokio::sync::mpsc;

use super::node::{NodeId, PolicyNode, RegistryEvent};
use crate::rule::{IMPLICIT_ID, Rule, Target};

/// Registry consistency check failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("registry invariant violated: {0}")]
pub struct InvariantViolation(pub String);

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<PolicyNode>,
}

/// Forest of policy nodes mirroring the daemon's device rules
///
/// Nodes attach under the node whose hash equals their `parent_hash`, or
/// under the synthetic root when that parent is not held at insertion time.
/// A child that arrives before its parent stays rooted; it is not
/// re-attached when the parent shows up later.
///
/// Rules with an empty hash are held but cannot be parents. Implicit rules
/// (rule id [`IMPLICIT_ID`]) may be held more than once; calls addressed to
/// the sentinel id act on all of them.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    roots: Vec<NodeId>,
    by_hash: HashMap<String, NodeId>,
    by_id: HashMap<u32, NodeId>,
    implicit: Vec<NodeId>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl PolicyRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every change notification from now on, in emission order
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: RegistryEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Insert a rule, attaching it under the node matching its parent hash
    ///
    /// Callers are expected to check [`Self::contains`] first. A rule whose
    /// hash is already held overwrites that node; a rule reusing a held id
    /// with a different hash evicts the stale node and its subtree.
    pub fn insert(&mut self, rule: Rule) -> NodeId {
        let rule_id = rule.rule_id();
        tracing::debug!(rule_id, hash = rule.hash(), parent_hash = rule.parent_hash(), "insert rule");

        if !rule.hash().is_empty() {
            if let Some(existing) = self.by_hash.get(rule.hash()).copied() {
                tracing::warn!(rule_id, hash = rule.hash(), "insert of held hash, overwriting");
                match self.replace_in_place(existing, rule) {
                    Ok(node) => return node,
                    Err(rule) => {
                        self.remove_subtree(existing);
                        return self.insert(rule);
                    }
                }
            }
        }

        if rule_id != IMPLICIT_ID {
            if let Some(stale) = self.by_id.get(&rule_id).copied() {
                tracing::warn!(rule_id, "insert of held rule id, evicting stale node");
                self.remove_subtree(stale);
            }
        }

        let parent = if rule.parent_hash().is_empty() {
            None
        } else {
            self.by_hash.get(rule.parent_hash()).copied()
        };

        let id = self.allocate();
        let hash = rule.hash().to_string();
        self.slots[id.index as usize].node = Some(PolicyNode::new(id, rule, parent));
        self.len += 1;

        match parent.and_then(|p| self.node_mut(p)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.roots.push(id),
        }
        if !hash.is_empty() {
            self.by_hash.insert(hash, id);
        }
        self.index_id(rule_id, id);

        self.emit(RegistryEvent::Inserted {
            node: id,
            rule_id,
            parent,
        });
        id
    }

    /// Overwrite a node's rule when its placement would not change
    ///
    /// Hands the rule back if the parent hash or rule id differ.
    fn replace_in_place(&mut self, node: NodeId, rule: Rule) -> Result<NodeId, Rule> {
        let Some(current) = self.get(node) else {
            return Err(rule);
        };
        if current.rule.parent_hash() != rule.parent_hash() || current.rule_id() != rule.rule_id() {
            return Err(rule);
        }

        let rule_id = rule.rule_id();
        if let Some(slot) = self.node_mut(node) {
            slot.requested_target = rule.target();
            slot.rule = rule;
        }
        self.emit(RegistryEvent::Replaced { node, rule_id });
        Ok(node)
    }

    /// Remove the rule with this id together with every rule derived from it
    ///
    /// No-op for unknown ids.
    pub fn remove(&mut self, rule_id: u32) {
        if rule_id == IMPLICIT_ID {
            let implicit = self.implicit.clone();
            for node in implicit {
                // An earlier subtree removal may already have taken it
                if self.get(node).is_some() {
                    self.remove_subtree(node);
                }
            }
            return;
        }

        match self.by_id.get(&rule_id).copied() {
            Some(node) => self.remove_subtree(node),
            None => tracing::debug!(rule_id, "remove of unknown rule id ignored"),
        }
    }

    /// Remove a node and its descendants, children before parents
    fn remove_subtree(&mut self, top: NodeId) {
        let mut order = Vec::new();
        let mut stack = vec![(top, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            if let Some(n) = self.get(node) {
                stack.extend(n.children.iter().rev().map(|&c| (c, false)));
            }
        }

        for node in order {
            let Some(removed) = self.slots.get_mut(node.index as usize).and_then(|s| s.node.take()) else {
                continue;
            };
            self.unindex(&removed);

            match removed.parent.and_then(|p| self.node_mut(p)) {
                Some(parent) => parent.children.retain(|&c| c != node),
                None => self.roots.retain(|&c| c != node),
            }

            let slot = &mut self.slots[node.index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(node.index);
            self.len -= 1;

            tracing::debug!(rule_id = removed.rule_id(), hash = removed.hash(), "removed rule");
            self.emit(RegistryEvent::Removed {
                rule_id: removed.rule_id(),
                hash: removed.rule.hash().to_string(),
            });
        }
    }

    /// Record a daemon-confirmed target, clearing any staged override
    ///
    /// Returns whether anything changed; repeating a call is a no-op.
    pub fn update_target(&mut self, rule_id: u32, target: Target) -> bool {
        let nodes = self.nodes_for(rule_id);
        if nodes.is_empty() {
            tracing::debug!(rule_id, %target, "target update for unknown rule id ignored");
            return false;
        }

        let mut changed = false;
        for node in nodes {
            let Some(n) = self.node_mut(node) else {
                continue;
            };
            if n.rule.target() == target && n.requested_target == target {
                continue;
            }

            let previous = n.rule.target();
            n.rule.set_target(target);
            n.requested_target = target;
            changed = true;

            self.emit(RegistryEvent::TargetChanged {
                node,
                rule_id,
                previous,
                target,
            });
        }
        changed
    }

    /// Stage a user override on a node
    ///
    /// Returns false if the node is gone or already requests this target.
    pub fn stage_requested_target(&mut self, node: NodeId, target: Target) -> bool {
        let Some(n) = self.node_mut(node) else {
            return false;
        };
        if n.requested_target == target {
            return false;
        }

        n.requested_target = target;
        let rule_id = n.rule_id();
        tracing::debug!(rule_id, %target, "staged requested target");
        self.emit(RegistryEvent::RequestedTargetChanged {
            node,
            rule_id,
            requested: target,
        });
        true
    }

    /// Stage a user override by rule id
    pub fn stage(&mut self, rule_id: u32, target: Target) -> bool {
        self.node_by_id(rule_id)
            .is_some_and(|node| self.stage_requested_target(node, target))
    }

    /// Staged overrides awaiting commit, by rule id
    ///
    /// Implicit nodes share one key; the last one in index order wins.
    #[must_use]
    pub fn modified(&self) -> BTreeMap<u32, Target> {
        self.iter()
            .filter(|n| n.is_modified())
            .map(|n| (n.rule_id(), n.requested_target))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, rule_id: u32) -> bool {
        if rule_id == IMPLICIT_ID {
            !self.implicit.is_empty()
        } else {
            self.by_id.contains_key(&rule_id)
        }
    }

    /// Drop the entire forest
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                #[allow(clippy::cast_possible_truncation)]
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        self.roots.clear();
        self.by_hash.clear();
        self.by_id.clear();
        self.implicit.clear();
        tracing::debug!("registry cleared");
        self.emit(RegistryEvent::Cleared);
    }

    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&PolicyNode> {
        self.slots
            .get(node.index as usize)
            .filter(|s| s.generation == node.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, node: NodeId) -> Option<&mut PolicyNode> {
        self.slots
            .get_mut(node.index as usize)
            .filter(|s| s.generation == node.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Node holding this rule id (the first implicit node for the sentinel)
    #[must_use]
    pub fn node_by_id(&self, rule_id: u32) -> Option<NodeId> {
        if rule_id == IMPLICIT_ID {
            self.implicit.first().copied()
        } else {
            self.by_id.get(&rule_id).copied()
        }
    }

    #[must_use]
    pub fn node_by_hash(&self, hash: &str) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Top-level nodes, in insertion order
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.get(node).map_or(&[], PolicyNode::children)
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.get(node).and_then(PolicyNode::parent)
    }

    /// All held nodes in slot order
    pub fn iter(&self) -> impl Iterator<Item = &PolicyNode> {
        self.slots.iter().filter_map(|s| s.node.as_ref())
    }

    /// Depth-first pre-order traversal yielding `(depth, node)`
    #[must_use]
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            registry: self,
            stack: self.roots.iter().rev().map(|&n| (0, n)).collect(),
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check that the arena, both indexes and the tree links agree
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let fail = |msg: String| Err(InvariantViolation(msg));

        let live: Vec<&PolicyNode> = self.iter().collect();
        if live.len() != self.len {
            return fail(format!("len {} but {} live nodes", self.len, live.len()));
        }

        let mut hashed = 0;
        for node in &live {
            if self.get(node.id).map(|n| n.id) != Some(node.id) {
                return fail(format!("node {} does not resolve to itself", node.id));
            }

            if !node.hash().is_empty() {
                hashed += 1;
                if self.by_hash.get(node.hash()) != Some(&node.id) {
                    return fail(format!("hash {:?} not indexed to {}", node.hash(), node.id));
                }
            }

            if node.rule_id() == IMPLICIT_ID {
                if !self.implicit.contains(&node.id) {
                    return fail(format!("implicit node {} not indexed", node.id));
                }
            } else if self.by_id.get(&node.rule_id()) != Some(&node.id) {
                return fail(format!("rule id {} not indexed to {}", node.rule_id(), node.id));
            }

            match node.parent {
                Some(p) => {
                    let Some(parent) = self.get(p) else {
                        return fail(format!("node {} has dangling parent {p}", node.id));
                    };
                    if parent.hash() != node.rule.parent_hash() || parent.hash().is_empty() {
                        return fail(format!(
                            "node {} parent hash {:?} but parent holds {:?}",
                            node.id,
                            node.rule.parent_hash(),
                            parent.hash()
                        ));
                    }
                    if !parent.children.contains(&node.id) {
                        return fail(format!("parent {p} does not list child {}", node.id));
                    }
                }
                None => {
                    if !self.roots.contains(&node.id) {
                        return fail(format!("parentless node {} missing from roots", node.id));
                    }
                }
            }

            for &child in &node.children {
                if self.get(child).and_then(|c| c.parent) != Some(node.id) {
                    return fail(format!("child {child} of {} does not point back", node.id));
                }
            }
        }

        if self.by_hash.len() != hashed {
            return fail(format!("{} hash entries for {hashed} hashed nodes", self.by_hash.len()));
        }
        if self.by_id.len() + self.implicit.len() != self.len {
            return fail(format!(
                "{} id entries and {} implicit for {} nodes",
                self.by_id.len(),
                self.implicit.len(),
                self.len
            ));
        }
        if self.roots.iter().any(|&r| self.get(r).is_none_or(|n| n.parent.is_some())) {
            return fail("roots list holds a non-root".to_string());
        }

        // Every node reachable from the root exactly once
        let mut seen = HashSet::new();
        for (_, node) in self.walk() {
            if !seen.insert(node.id) {
                return fail(format!("node {} reachable twice", node.id));
            }
            if seen.len() > self.len {
                return fail("cycle detected".to_string());
            }
        }
        if seen.len() != self.len {
            return fail(format!("{} of {} nodes reachable from root", seen.len(), self.len));
        }

        Ok(())
    }

    fn allocate(&mut self) -> NodeId {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            return NodeId { index, generation };
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = self.slots.len() as u32;
        self.slots.push(Slot::default());
        NodeId { index, generation: 0 }
    }

    fn index_id(&mut self, rule_id: u32, node: NodeId) {
        if rule_id == IMPLICIT_ID {
            self.implicit.push(node);
        } else {
            self.by_id.insert(rule_id, node);
        }
    }

    fn unindex(&mut self, node: &PolicyNode) {
        if self.by_hash.get(node.hash()) == Some(&node.id) {
            self.by_hash.remove(node.hash());
        }
        if node.rule_id() == IMPLICIT_ID {
            self.implicit.retain(|&n| n != node.id);
        } else if self.by_id.get(&node.rule_id()) == Some(&node.id) {
            self.by_id.remove(&node.rule_id());
        }
    }

    fn nodes_for(&self, rule_id: u32) -> Vec<NodeId> {
        if rule_id == IMPLICIT_ID {
            self.implicit.clone()
        } else {
            self.by_id.get(&rule_id).copied().into_iter().collect()
        }
    }
}

/// Pre-order traversal over a [`PolicyRegistry`]
pub struct Walk<'a> {
    registry: &'a PolicyRegistry,
    stack: Vec<(usize, NodeId)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a PolicyNode);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (depth, id) = self.stack.pop()?;
            let Some(node) = self.registry.get(id) else {
                continue;
            };
            // Bounded by the node count so a corrupt link cannot loop forever
            if self.stack.len() <= self.registry.len {
                self.stack
                    .extend(node.children.iter().rev().map(|&c| (depth + 1, c)));
            }
            return Some((depth, node));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: u32, hash: &str, parent: &str, target: Target) -> Rule {
        Rule::new(target)
            .with_rule_id(id)
            .with_hash(hash)
            .with_parent_hash(parent)
    }

    #[test]
    fn insert_indexes_both_ways() {
        let mut registry = PolicyRegistry::new();
        let node = registry.insert(rule(1, "h1", "", Target::Block));

        assert!(registry.contains(1));
        assert_eq!(registry.node_by_id(1), Some(node));
        assert_eq!(registry.node_by_hash("h1"), Some(node));
        assert_eq!(registry.roots(), &[node]);
        assert_eq!(registry.len(), 1);
        registry.verify().unwrap();
    }

    #[test]
    fn child_attaches_under_parent_hash() {
        let mut registry = PolicyRegistry::new();
        let parent = registry.insert(rule(1, "h1", "", Target::Block));
        let child = registry.insert(rule(2, "h2", "h1", Target::Allow));

        assert_eq!(registry.parent(child), Some(parent));
        assert_eq!(registry.children(parent), &[child]);
        assert_eq!(registry.roots(), &[parent]);
        registry.verify().unwrap();
    }

    #[test]
    fn orphan_stays_rooted_after_parent_arrives() {
        let mut registry = PolicyRegistry::new();
        let orphan = registry.insert(rule(2, "h2", "h1", Target::Allow));
        let parent = registry.insert(rule(1, "h1", "", Target::Block));

        assert_eq!(registry.parent(orphan), None);
        assert!(registry.children(parent).is_empty());
        assert_eq!(registry.roots(), &[orphan, parent]);
        registry.verify().unwrap();
    }

    #[test]
    fn empty_parent_hash_never_matches_unhashed_node() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "", "", Target::Allow));
        let second = registry.insert(rule(2, "h2", "", Target::Allow));
        assert_eq!(registry.parent(second), None);
        registry.verify().unwrap();
    }

    #[test]
    fn remove_cascades_post_order() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        registry.insert(rule(2, "h2", "h1", Target::Allow));
        registry.insert(rule(3, "h3", "h2", Target::Allow));
        registry.insert(rule(4, "h4", "", Target::Allow));
        let mut events = registry.subscribe();

        registry.remove(1);

        let removed: Vec<u32> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                RegistryEvent::Removed { rule_id, .. } => Some(rule_id),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![3, 2, 1]);
        assert!(registry.contains(4));
        assert_eq!(registry.len(), 1);
        registry.verify().unwrap();
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        registry.remove(99);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_handles_do_not_resolve_after_reuse() {
        let mut registry = PolicyRegistry::new();
        let old = registry.insert(rule(1, "h1", "", Target::Block));
        registry.remove(1);
        let new = registry.insert(rule(2, "h2", "", Target::Block));

        assert_eq!(old.index, new.index);
        assert!(registry.get(old).is_none());
        assert!(!registry.stage_requested_target(old, Target::Allow));
        assert_eq!(registry.get(new).unwrap().rule_id(), 2);
    }

    #[test]
    fn update_target_is_idempotent() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        let mut events = registry.subscribe();

        assert!(registry.update_target(1, Target::Allow));
        assert!(!registry.update_target(1, Target::Allow));

        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::TargetChanged { previous: Target::Block, target: Target::Allow, .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn update_target_clears_staged_override() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        assert!(registry.stage(1, Target::Reject));

        assert!(registry.update_target(1, Target::Block));
        let node = registry.get(registry.node_by_id(1).unwrap()).unwrap();
        assert_eq!(node.requested_target(), Target::Block);
        assert!(registry.modified().is_empty());
    }

    #[test]
    fn update_unknown_is_noop() {
        let mut registry = PolicyRegistry::new();
        assert!(!registry.update_target(5, Target::Allow));
    }

    #[test]
    fn staging_and_unstaging() {
        let mut registry = PolicyRegistry::new();
        let node = registry.insert(rule(1, "h1", "", Target::Block));
        registry.insert(rule(2, "h2", "", Target::Allow));

        assert!(registry.stage_requested_target(node, Target::Allow));
        assert!(!registry.stage_requested_target(node, Target::Allow));
        assert_eq!(registry.modified(), BTreeMap::from([(1, Target::Allow)]));

        assert!(registry.stage_requested_target(node, Target::Block));
        assert!(registry.modified().is_empty());
    }

    #[test]
    fn duplicate_hash_overwrites_in_place() {
        let mut registry = PolicyRegistry::new();
        let parent = registry.insert(rule(1, "h1", "", Target::Block));
        let child = registry.insert(rule(2, "h2", "h1", Target::Block));

        let again = registry.insert(rule(1, "h1", "", Target::Allow).with_name("renamed"));

        assert_eq!(again, parent);
        assert_eq!(registry.children(parent), &[child]);
        assert_eq!(registry.get(parent).unwrap().rule().name(), "renamed");
        assert_eq!(registry.get(parent).unwrap().target(), Target::Allow);
        assert_eq!(registry.len(), 2);
        registry.verify().unwrap();
    }

    #[test]
    fn duplicate_hash_with_new_placement_reinserts() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        registry.insert(rule(2, "h2", "h1", Target::Block));

        registry.insert(rule(7, "h1", "", Target::Block));

        assert!(!registry.contains(1));
        assert!(!registry.contains(2));
        assert!(registry.contains(7));
        registry.verify().unwrap();
    }

    #[test]
    fn duplicate_id_evicts_stale_node() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "old", "", Target::Block));
        registry.insert(rule(1, "new", "", Target::Allow));

        assert_eq!(registry.len(), 1);
        assert!(registry.node_by_hash("old").is_none());
        assert!(registry.node_by_hash("new").is_some());
        registry.verify().unwrap();
    }

    #[test]
    fn implicit_ids_may_repeat() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(IMPLICIT_ID, "a", "", Target::Block));
        registry.insert(rule(IMPLICIT_ID, "b", "", Target::Block));
        registry.verify().unwrap();

        assert!(registry.contains(IMPLICIT_ID));
        assert!(registry.update_target(IMPLICIT_ID, Target::Allow));
        assert!(registry.iter().all(|n| n.target() == Target::Allow));

        registry.remove(IMPLICIT_ID);
        assert!(registry.is_empty());
        assert!(!registry.contains(IMPLICIT_ID));
        registry.verify().unwrap();
    }

    #[test]
    fn clear_drops_everything_once() {
        let mut registry = PolicyRegistry::new();
        let node = registry.insert(rule(1, "h1", "", Target::Block));
        registry.insert(rule(2, "h2", "h1", Target::Block));
        let mut events = registry.subscribe();

        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.get(node).is_none());
        assert!(!registry.contains(1));
        assert_eq!(events.try_recv(), Ok(RegistryEvent::Cleared));
        assert!(events.try_recv().is_err());
        registry.verify().unwrap();
    }

    #[test]
    fn walk_is_preorder_with_depth() {
        let mut registry = PolicyRegistry::new();
        registry.insert(rule(1, "h1", "", Target::Block));
        registry.insert(rule(2, "h2", "h1", Target::Block));
        registry.insert(rule(3, "h3", "h2", Target::Block));
        registry.insert(rule(4, "h4", "h1", Target::Block));
        registry.insert(rule(5, "h5", "", Target::Block));

        let order: Vec<(usize, u32)> = registry.walk().map(|(d, n)| (d, n.rule_id())).collect();
        assert_eq!(order, vec![(0, 1), (1, 2), (2, 3), (1, 4), (0, 5)]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut registry = PolicyRegistry::new();
        drop(registry.subscribe());
        let mut live = registry.subscribe();

        registry.insert(rule(1, "h1", "", Target::Block));

        assert_eq!(registry.subscribers.len(), 1);
        assert!(matches!(live.try_recv(), Ok(RegistryEvent::Inserted { rule_id: 1, .. })));
    }
}
