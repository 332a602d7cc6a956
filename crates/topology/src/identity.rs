//! Per-boot node identities and the identity map carried inside a config

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeName;

/// Opaque identity of a node's persistent state.
///
/// Created once when a node's state is initialized and replaced only when
/// that state is wiped. Seeing a different identity for a known node name
/// therefore means the node was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(Uuid);

impl NodeIdentity {
    /// Generate a fresh random identity
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying uuid
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// The running node: its name and current identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    /// Node name
    pub name: NodeName,
    /// Identity of the node's current persistent state
    pub identity: NodeIdentity,
}

impl LocalNode {
    /// Create a local node descriptor
    pub fn new(name: impl Into<NodeName>, identity: NodeIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }
}

/// Bidirectional mapping between node names and identities.
///
/// Only the forward map is authoritative; the reverse map is rebuilt from it
/// after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    forward: BTreeMap<NodeName, NodeIdentity>,
    reverse: BTreeMap<NodeIdentity, NodeName>,
}

impl IdentityMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a forward map
    #[must_use]
    pub fn from_forward(forward: BTreeMap<NodeName, NodeIdentity>) -> Self {
        let mut map = Self {
            forward,
            reverse: BTreeMap::new(),
        };
        map.rebuild_reverse();
        map
    }

    /// Identity currently recorded for `node`
    #[must_use]
    pub fn identity_of(&self, node: &NodeName) -> Option<NodeIdentity> {
        self.forward.get(node).copied()
    }

    /// Node currently recorded for `identity`
    #[must_use]
    pub fn node_with(&self, identity: &NodeIdentity) -> Option<&NodeName> {
        self.reverse.get(identity)
    }

    /// Forward entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeName, &NodeIdentity)> {
        self.forward.iter()
    }

    /// Number of mapped nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// The forward map
    #[must_use]
    pub const fn forward(&self) -> &BTreeMap<NodeName, NodeIdentity> {
        &self.forward
    }

    /// Union of `dest` and `src`, `dest` winning on conflicts.
    #[must_use]
    pub fn union_preferring(dest: &Self, src: &Self) -> Self {
        let mut forward = dest.forward.clone();
        for (name, identity) in &src.forward {
            if !forward.contains_key(name) && !dest.reverse.contains_key(identity) {
                forward.insert(name.clone(), *identity);
            }
        }
        Self::from_forward(forward)
    }

    /// Set `node`'s identity, returning the previous identity if any.
    ///
    /// Any other node recorded under the same identity is dropped, as an
    /// identity token belongs to exactly one node.
    pub fn insert(&mut self, node: NodeName, identity: NodeIdentity) -> Option<NodeIdentity> {
        self.forward
            .retain(|name, existing| *existing != identity || *name == node);
        let previous = self.forward.insert(node, identity);
        self.rebuild_reverse();
        previous
    }

    fn rebuild_reverse(&mut self) {
        self.reverse = self
            .forward
            .iter()
            .map(|(name, identity)| (*identity, name.clone()))
            .collect();
    }
}
