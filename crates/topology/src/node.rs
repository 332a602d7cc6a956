//! Node names and node list normalization

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigField};
use crate::role::NodeRole;

/// Name of a cluster node, e.g. `rabbit@host-a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Create a node name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A member of a cluster config: name plus role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node name
    pub name: NodeName,
    /// Storage role
    pub role: NodeRole,
}

impl ClusterNode {
    /// A disk node
    pub fn disk(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            role: NodeRole::Disk,
        }
    }

    /// A memory-only node
    pub fn ram(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            role: NodeRole::Ram,
        }
    }
}

/// Raw node entry as written by an operator. The role is optional and may
/// use any alias understood by [`NodeRole`]; a missing role means disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name
    pub name: String,
    /// Role alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl NodeSpec {
    /// Entry with an explicit role alias
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Some(role.into()),
        }
    }

    /// Entry without a role (defaults to disk)
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: None,
        }
    }
}

impl From<&ClusterNode> for NodeSpec {
    fn from(node: &ClusterNode) -> Self {
        Self::new(node.name.as_str(), node.role.as_str())
    }
}

/// Normalize a raw node list.
///
/// Role aliases are canonicalized, exact duplicates collapse and the result
/// is sorted by name. Two entries sharing a name with different roles, an
/// unknown role, an empty name or the absence of any disk node are errors.
pub fn normalize(nodes: &[NodeSpec]) -> Result<Vec<ClusterNode>, ConfigError> {
    let mut by_name: BTreeMap<NodeName, NodeRole> = BTreeMap::new();

    for spec in nodes {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ConfigError::new(ConfigField::Nodes, "empty node name"));
        }

        let role = match &spec.role {
            Some(alias) => alias
                .parse::<NodeRole>()
                .map_err(|reason| ConfigError::new(ConfigField::Nodes, reason))?,
            None => NodeRole::Disk,
        };

        let name = NodeName::new(name);
        match by_name.get(&name) {
            Some(existing) if *existing != role => {
                return Err(ConfigError::new(
                    ConfigField::Nodes,
                    format!("node {name} listed as both {existing} and {role}"),
                ));
            }
            Some(_) => {}
            None => {
                by_name.insert(name, role);
            }
        }
    }

    if !by_name.values().any(|role| role.is_disk()) {
        return Err(ConfigError::new(
            ConfigField::Nodes,
            "at least one disk node is required",
        ));
    }

    Ok(by_name
        .into_iter()
        .map(|(name, role)| ClusterNode { name, role })
        .collect())
}
