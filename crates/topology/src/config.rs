//! Versioned cluster configuration
//!
//! A `ClusterConfig` is never changed in place: every update produces a new
//! value. Configs are ordered by `version`; two configs with the same version
//! must agree on nodes, gospel and shutdown timeout, otherwise the pair is
//! invalid. Identity maps are bookkeeping and never take part in comparison.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigField};
use crate::identity::{IdentityMap, LocalNode, NodeIdentity};
use crate::node::{ClusterNode, NodeName, NodeSpec, normalize};
use crate::role::NodeRole;

/// Seed policy of a config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gospel {
    /// Every node starts from a wiped state.
    Reset,
    /// The named disk node's state is authoritative.
    Node(NodeName),
}

/// How long a node waits for peers when shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownTimeout {
    /// Wait forever
    Infinite,
    /// Wait at most this long
    After(Duration),
}

/// Result of [`ClusterConfig::compare`], read as "`self` is ... than `other`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigComparison {
    /// Lower version
    Older,
    /// Same version, same substance
    Coeval,
    /// Higher version
    Younger,
    /// Same version, different substance
    Invalid,
}

/// Immutable description of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConfigRecord", into = "ConfigRecord")]
pub struct ClusterConfig {
    version: u64,
    nodes: Vec<ClusterNode>,
    gospel: Gospel,
    shutdown_timeout: ShutdownTimeout,
    node_ids: IdentityMap,
}

/// Wire form of a config: the reverse identity map is derived, so it is
/// rebuilt on decode rather than transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigRecord {
    version: u64,
    nodes: Vec<ClusterNode>,
    gospel: Gospel,
    shutdown_timeout: ShutdownTimeout,
    #[serde(default)]
    node_ids: BTreeMap<NodeName, NodeIdentity>,
}

impl From<ClusterConfig> for ConfigRecord {
    fn from(config: ClusterConfig) -> Self {
        Self {
            version: config.version,
            nodes: config.nodes,
            gospel: config.gospel,
            shutdown_timeout: config.shutdown_timeout,
            node_ids: config.node_ids.forward().clone(),
        }
    }
}

impl TryFrom<ConfigRecord> for ClusterConfig {
    type Error = ConfigError;

    fn try_from(record: ConfigRecord) -> Result<Self, Self::Error> {
        Ok(Self::new(
            record.version,
            record.nodes,
            record.gospel,
            record.shutdown_timeout,
        )?
        .with_node_ids(IdentityMap::from_forward(record.node_ids)))
    }
}

impl ClusterConfig {
    /// Build a config from typed parts, normalizing the node list and
    /// checking the gospel.
    pub fn new(
        version: u64,
        nodes: Vec<ClusterNode>,
        gospel: Gospel,
        shutdown_timeout: ShutdownTimeout,
    ) -> Result<Self, ConfigError> {
        let specs: Vec<NodeSpec> = nodes.iter().map(NodeSpec::from).collect();
        let nodes = normalize(&specs)?;
        check_gospel(&gospel, &nodes)?;

        Ok(Self {
            version,
            nodes,
            gospel,
            shutdown_timeout,
            node_ids: IdentityMap::new(),
        })
    }

    /// Replace the identity map
    #[must_use]
    pub fn with_node_ids(mut self, node_ids: IdentityMap) -> Self {
        self.node_ids = node_ids;
        self
    }

    /// Config version
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Members, sorted by name
    #[must_use]
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Seed policy
    #[must_use]
    pub const fn gospel(&self) -> &Gospel {
        &self.gospel
    }

    /// Shutdown timeout
    #[must_use]
    pub const fn shutdown_timeout(&self) -> ShutdownTimeout {
        self.shutdown_timeout
    }

    /// Identity bookkeeping
    #[must_use]
    pub const fn node_ids(&self) -> &IdentityMap {
        &self.node_ids
    }

    /// Names of all members
    #[must_use]
    pub fn node_names(&self) -> BTreeSet<NodeName> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Names of disk members
    #[must_use]
    pub fn disk_nodes(&self) -> BTreeSet<NodeName> {
        self.nodes_with_role(NodeRole::Disk)
    }

    /// Names of memory-only members
    #[must_use]
    pub fn ram_nodes(&self) -> BTreeSet<NodeName> {
        self.nodes_with_role(NodeRole::Ram)
    }

    fn nodes_with_role(&self, role: NodeRole) -> BTreeSet<NodeName> {
        self.nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Role of `node`, if it is a member
    #[must_use]
    pub fn role_of(&self, node: &NodeName) -> Option<NodeRole> {
        self.nodes.iter().find(|n| &n.name == node).map(|n| n.role)
    }

    /// Whether `node` is a member
    #[must_use]
    pub fn contains_node(&self, node: &NodeName) -> bool {
        self.role_of(node).is_some()
    }

    /// Whether `node` is the only disk member, i.e. it depends on nobody.
    #[must_use]
    pub fn is_sole_disk_node(&self, node: &NodeName) -> bool {
        let disk = self.disk_nodes();
        disk.len() == 1 && disk.contains(node)
    }

    /// Identity recorded for `node`
    #[must_use]
    pub fn identity_of(&self, node: &NodeName) -> Option<NodeIdentity> {
        self.node_ids.identity_of(node)
    }

    /// Node recorded under `identity`
    #[must_use]
    pub fn node_with_identity(&self, identity: &NodeIdentity) -> Option<&NodeName> {
        self.node_ids.node_with(identity)
    }

    /// Compare `self` against `other` by version, checking that equal
    /// versions agree in substance.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ConfigComparison {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Greater => ConfigComparison::Younger,
            std::cmp::Ordering::Less => ConfigComparison::Older,
            std::cmp::Ordering::Equal => {
                let same_nodes = self.nodes.iter().collect::<BTreeSet<_>>()
                    == other.nodes.iter().collect::<BTreeSet<_>>();
                if same_nodes
                    && self.gospel == other.gospel
                    && self.shutdown_timeout == other.shutdown_timeout
                {
                    ConfigComparison::Coeval
                } else {
                    ConfigComparison::Invalid
                }
            }
        }
    }

    /// Merge the identity maps of `dest` and `src` into a copy of `dest`.
    ///
    /// `dest` wins on conflicts. The local node's current identity is always
    /// re-inserted, covering both a local reset since the map was built and a
    /// local node that was absent from `dest`.
    #[must_use]
    pub fn merge_identities(local: &LocalNode, dest: &Self, src: &Self) -> Self {
        let mut node_ids = IdentityMap::union_preferring(&dest.node_ids, &src.node_ids);
        node_ids.insert(local.name.clone(), local.identity);
        dest.clone().with_node_ids(node_ids)
    }

    /// Record that `node` currently runs with `identity`.
    ///
    /// Returns `true` when `node` was previously known under a different
    /// identity, meaning it has been reset since it was last seen.
    #[must_use]
    pub fn record_peer_identity(
        &self,
        node: &NodeName,
        identity: NodeIdentity,
        local: &LocalNode,
    ) -> (bool, Self) {
        let mut node_ids = self.node_ids.clone();
        let changed = if node == &local.name {
            false
        } else {
            match node_ids.insert(node.clone(), identity) {
                Some(previous) if previous != identity => {
                    debug!(%node, %previous, current = %identity, "peer identity changed");
                    true
                }
                _ => false,
            }
        };
        node_ids.insert(local.name.clone(), local.identity);

        (changed, self.clone().with_node_ids(node_ids))
    }

    /// Whether moving from `old` to `new` is a soft evolution of the same
    /// cluster lineage, as opposed to something that must be treated like a
    /// first join.
    #[must_use]
    pub fn detect_continuity(new: &Self, old: Option<&Self>) -> bool {
        let Some(old) = old else {
            return false;
        };
        match &new.gospel {
            Gospel::Reset => false,
            Gospel::Node(gospel) => {
                match (new.identity_of(gospel), old.identity_of(gospel)) {
                    (Some(new_id), Some(old_id)) => new_id == old_id,
                    _ => true,
                }
            }
        }
    }
}

fn check_gospel(gospel: &Gospel, nodes: &[ClusterNode]) -> Result<(), ConfigError> {
    match gospel {
        Gospel::Reset => Ok(()),
        Gospel::Node(name) => match nodes.iter().find(|n| &n.name == name) {
            Some(node) if node.role.is_disk() => Ok(()),
            Some(_) => Err(ConfigError::new(
                ConfigField::Gospel,
                format!("gospel node {name} is not a disk node"),
            )),
            None => Err(ConfigError::new(
                ConfigField::Gospel,
                format!("gospel node {name} is not in nodes"),
            )),
        },
    }
}

/// Raw gospel as written by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GospelSpec {
    /// `reset`
    Reset,
    /// A node name
    Node(String),
}

/// Raw shutdown timeout as written by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownTimeoutSpec {
    /// `infinity`
    Infinity,
    /// Seconds, must not be negative
    Seconds(i64),
}

/// Unvalidated config as read from an operator-supplied source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfigSpec {
    /// Must not be negative
    pub version: i64,
    /// Node entries
    pub nodes: Vec<NodeSpec>,
    /// Seed policy
    pub gospel: GospelSpec,
    /// Shutdown timeout
    pub shutdown_timeout: ShutdownTimeoutSpec,
}

/// Validate each field of `spec` in isolation, returning the first
/// violation found.
pub fn validate(spec: &ClusterConfigSpec) -> Result<ClusterConfig, ConfigError> {
    let version = u64::try_from(spec.version).map_err(|_| {
        ConfigError::new(
            ConfigField::Version,
            format!("version must not be negative, got {}", spec.version),
        )
    })?;

    let nodes = normalize(&spec.nodes)?;

    let gospel = match &spec.gospel {
        GospelSpec::Reset => Gospel::Reset,
        GospelSpec::Node(name) => Gospel::Node(NodeName::new(name.trim())),
    };
    check_gospel(&gospel, &nodes)?;

    let shutdown_timeout = match spec.shutdown_timeout {
        ShutdownTimeoutSpec::Infinity => ShutdownTimeout::Infinite,
        ShutdownTimeoutSpec::Seconds(secs) => {
            let secs = u64::try_from(secs).map_err(|_| {
                ConfigError::new(
                    ConfigField::ShutdownTimeout,
                    format!("timeout must not be negative, got {secs}"),
                )
            })?;
            ShutdownTimeout::After(Duration::from_secs(secs))
        }
    };

    Ok(ClusterConfig {
        version,
        nodes,
        gospel,
        shutdown_timeout,
        node_ids: IdentityMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn config(version: u64, disk: &[&str], gospel: Gospel) -> ClusterConfig {
        ClusterConfig::new(
            version,
            disk.iter().map(|n| ClusterNode::disk(*n)).collect(),
            gospel,
            ShutdownTimeout::Infinite,
        )
        .unwrap()
    }

    fn spec() -> ClusterConfigSpec {
        ClusterConfigSpec {
            version: 3,
            nodes: vec![NodeSpec::bare("b"), NodeSpec::new("a", "disc")],
            gospel: GospelSpec::Node("a".to_string()),
            shutdown_timeout: ShutdownTimeoutSpec::Seconds(30),
        }
    }

    #[test]
    fn test_validate_accepts_valid_spec() {
        let config = validate(&spec()).unwrap();
        assert_eq!(config.version(), 3);
        assert_eq!(config.disk_nodes().len(), 2);
        assert_eq!(config.gospel(), &Gospel::Node(NodeName::new("a")));
        assert_eq!(
            config.shutdown_timeout(),
            ShutdownTimeout::After(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_validate_reports_first_violation() {
        let mut bad = spec();
        bad.version = -1;
        bad.shutdown_timeout = ShutdownTimeoutSpec::Seconds(-5);
        assert_eq!(validate(&bad).unwrap_err().field, ConfigField::Version);

        let mut bad = spec();
        bad.shutdown_timeout = ShutdownTimeoutSpec::Seconds(-5);
        assert_eq!(
            validate(&bad).unwrap_err().field,
            ConfigField::ShutdownTimeout
        );

        let mut bad = spec();
        bad.gospel = GospelSpec::Node("z".to_string());
        assert_eq!(validate(&bad).unwrap_err().field, ConfigField::Gospel);
    }

    #[test]
    fn test_gospel_must_be_disk_node() {
        let err = ClusterConfig::new(
            1,
            vec![ClusterNode::disk("a"), ClusterNode::ram("b")],
            Gospel::Node(NodeName::new("b")),
            ShutdownTimeout::Infinite,
        )
        .unwrap_err();
        assert_eq!(err.field, ConfigField::Gospel);
    }

    #[test]
    fn test_compare_by_version() {
        let v1 = config(1, &["a", "b"], Gospel::Reset);
        let v2 = config(2, &["a"], Gospel::Reset);

        assert_eq!(v1.compare(&v1), ConfigComparison::Coeval);
        assert_eq!(v1.compare(&v2), ConfigComparison::Older);
        assert_eq!(v2.compare(&v1), ConfigComparison::Younger);
    }

    #[test]
    fn test_compare_equal_version_different_substance_is_invalid() {
        let a = config(4, &["a", "b"], Gospel::Reset);
        let b = config(4, &["a", "c"], Gospel::Reset);
        let c = config(4, &["a", "b"], Gospel::Node(NodeName::new("a")));

        assert_eq!(a.compare(&b), ConfigComparison::Invalid);
        assert_eq!(a.compare(&c), ConfigComparison::Invalid);
    }

    #[test]
    fn test_compare_equal_version_different_shutdown_timeout_is_invalid() {
        let infinite = config(4, &["a", "b"], Gospel::Reset);
        let bounded = ClusterConfig::new(
            4,
            vec![ClusterNode::disk("a"), ClusterNode::disk("b")],
            Gospel::Reset,
            ShutdownTimeout::After(Duration::from_secs(30)),
        )
        .unwrap();

        assert_eq!(infinite.compare(&bounded), ConfigComparison::Invalid);
        assert_eq!(bounded.compare(&infinite), ConfigComparison::Invalid);
    }

    #[test]
    fn test_compare_ignores_identity_maps() {
        let local = LocalNode::new("a", NodeIdentity::generate());
        let a = config(4, &["a", "b"], Gospel::Reset);
        let (_, b) = a.record_peer_identity(&NodeName::new("b"), NodeIdentity::generate(), &local);

        assert_ne!(a, b);
        assert_eq!(a.compare(&b), ConfigComparison::Coeval);
    }

    #[test]
    fn test_merge_identities_reinserts_local_identity() {
        let old_local = LocalNode::new("a", NodeIdentity::generate());
        let new_local = LocalNode::new("a", NodeIdentity::generate());
        let b = NodeName::new("b");
        let b_id = NodeIdentity::generate();

        let base = config(1, &["a", "b"], Gospel::Reset);
        let (_, dest) = base.record_peer_identity(&b, b_id, &old_local);
        let (_, src) = base.record_peer_identity(&b, NodeIdentity::generate(), &old_local);

        let merged = ClusterConfig::merge_identities(&new_local, &dest, &src);
        assert_eq!(merged.identity_of(&b), Some(b_id));
        assert_eq!(merged.identity_of(&new_local.name), Some(new_local.identity));
        assert_eq!(
            merged.node_with_identity(&new_local.identity),
            Some(&new_local.name)
        );
        assert_eq!(merged.node_with_identity(&old_local.identity), None);
    }

    #[test]
    fn test_record_peer_identity_detects_reset() {
        let local = LocalNode::new("a", NodeIdentity::generate());
        let b = NodeName::new("b");
        let first = NodeIdentity::generate();
        let second = NodeIdentity::generate();

        let config = config(1, &["a", "b"], Gospel::Reset);
        let (changed, config) = config.record_peer_identity(&b, first, &local);
        assert!(!changed);

        let (changed, same) = config.record_peer_identity(&b, first, &local);
        assert!(!changed);
        assert_eq!(same, config);

        let (changed, config) = config.record_peer_identity(&b, second, &local);
        assert!(changed);
        assert_eq!(config.identity_of(&b), Some(second));
        assert_eq!(config.node_with_identity(&first), None);
    }

    #[test]
    fn test_continuity_with_reset_gospel_is_false() {
        let old = config(1, &["a", "b"], Gospel::Node(NodeName::new("a")));
        let new = config(2, &["a", "b"], Gospel::Reset);

        assert!(!ClusterConfig::detect_continuity(&new, Some(&old)));
        assert!(!ClusterConfig::detect_continuity(&new, None));
    }

    #[test]
    fn test_continuity_tracks_gospel_identity() {
        let local = LocalNode::new("b", NodeIdentity::generate());
        let a = NodeName::new("a");
        let base = config(1, &["a", "b"], Gospel::Node(a.clone()));
        let (_, old) = base.record_peer_identity(&a, NodeIdentity::generate(), &local);

        assert!(!ClusterConfig::detect_continuity(&old, None));
        assert!(ClusterConfig::detect_continuity(&old, Some(&old)));
        assert!(ClusterConfig::detect_continuity(&base, Some(&old)));

        let (_, wiped) = old.record_peer_identity(&a, NodeIdentity::generate(), &local);
        assert!(!ClusterConfig::detect_continuity(&wiped, Some(&old)));
    }

    #[test]
    fn test_serde_rebuilds_reverse_map() {
        let local = LocalNode::new("a", NodeIdentity::generate());
        let (_, config) = config(7, &["a", "b"], Gospel::Reset).record_peer_identity(
            &NodeName::new("b"),
            NodeIdentity::generate(),
            &local,
        );

        let json = serde_json::to_string(&config).unwrap();
        let decoded: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(
            decoded.node_with_identity(&local.identity),
            Some(&local.name)
        );
    }

    proptest! {
        #[test]
        fn prop_compare_is_antisymmetric(va in 0u64..5, vb in 0u64..5) {
            let a = config(va, &["a", "b"], Gospel::Reset);
            let b = config(vb, &["a", "b"], Gospel::Reset);
            let expected = match a.compare(&b) {
                ConfigComparison::Younger => ConfigComparison::Older,
                ConfigComparison::Older => ConfigComparison::Younger,
                other => other,
            };
            prop_assert_eq!(b.compare(&a), expected);
            prop_assert_eq!(a.compare(&a), ConfigComparison::Coeval);
        }
    }
}
