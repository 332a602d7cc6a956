//! Interpreting a round of status replies

use std::collections::{BTreeMap, BTreeSet};

use proven_topology::{ClusterConfig, ConfigComparison, NodeName};

use crate::messages::{PeerStatus, StatusReply};
use crate::storage::ClusterStatus;

/// How the configs reported by peers relate to ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigVerdict {
    /// A peer holds a config of our version with different contents, or two
    /// peers hold different configs of the same newer version
    Invalid,
    /// The youngest config reported, newer than ours
    Younger(ClusterConfig),
    /// Peers holding configs older than ours
    Older(BTreeSet<NodeName>),
    /// Every peer that has a config agrees with ours
    Coeval,
}

/// Classify the configs in `replies` against `ours`.
///
/// A newer config takes precedence over peers that are behind: adopting it
/// restarts the attempt, after which those peers are brought up to date.
#[must_use]
pub fn classify_configs(
    ours: &ClusterConfig,
    replies: &BTreeMap<NodeName, StatusReply>,
) -> ConfigVerdict {
    let mut younger: BTreeMap<u64, &ClusterConfig> = BTreeMap::new();
    let mut older = BTreeSet::new();

    for (node, reply) in replies {
        let Some(theirs) = &reply.config else {
            continue;
        };
        match ours.compare(theirs) {
            ConfigComparison::Invalid => return ConfigVerdict::Invalid,
            ConfigComparison::Coeval => {}
            ConfigComparison::Younger => {
                older.insert(node.clone());
            }
            ConfigComparison::Older => {
                if let Some(seen) = younger.insert(theirs.version(), theirs) {
                    if seen.compare(theirs) != ConfigComparison::Coeval {
                        return ConfigVerdict::Invalid;
                    }
                }
            }
        }
    }

    match younger.pop_last() {
        Some((_, config)) => ConfigVerdict::Younger(config.clone()),
        None if !older.is_empty() => ConfigVerdict::Older(older),
        None => ConfigVerdict::Coeval,
    }
}

/// Nodes in the fresh-join procedure: those reporting `Joining` themselves
/// plus those any peer reports as joining.
#[must_use]
pub fn joining_nodes(replies: &BTreeMap<NodeName, StatusReply>) -> BTreeSet<NodeName> {
    replies
        .iter()
        .filter(|(_, reply)| reply.status == PeerStatus::Joining)
        .map(|(node, _)| node.clone())
        .chain(replies.values().flat_map(|reply| reply.joining.iter().cloned()))
        .collect()
}

/// Nodes the local node must wait for: disk nodes that were running at last
/// shutdown and are still configured, excluding itself and fresh joiners.
#[must_use]
pub fn dependency_set(
    local: &NodeName,
    config: &ClusterConfig,
    status: &ClusterStatus,
    joining: &BTreeSet<NodeName>,
) -> BTreeSet<NodeName> {
    let configured = config.node_names();
    status
        .disk
        .intersection(&status.running)
        .filter(|node| configured.contains(*node))
        .filter(|node| *node != local && !joining.contains(*node))
        .cloned()
        .collect()
}

/// Peers in `nodes` that report themselves as rejoining.
#[must_use]
pub fn rejoining_peers(
    nodes: &BTreeSet<NodeName>,
    replies: &BTreeMap<NodeName, StatusReply>,
) -> BTreeSet<NodeName> {
    nodes
        .iter()
        .filter(|node| {
            replies
                .get(*node)
                .is_some_and(|reply| reply.status == PeerStatus::Rejoining)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proven_topology::{ClusterNode, Gospel, NodeIdentity, ShutdownTimeout};

    fn n(name: &str) -> NodeName {
        NodeName::new(name)
    }

    fn set(names: &[&str]) -> BTreeSet<NodeName> {
        names.iter().map(|name| n(name)).collect()
    }

    fn config(version: u64, nodes: &[&str]) -> ClusterConfig {
        ClusterConfig::new(
            version,
            nodes.iter().map(|name| ClusterNode::disk(*name)).collect(),
            Gospel::Reset,
            ShutdownTimeout::Infinite,
        )
        .unwrap()
    }

    fn reply(node: &str, config: Option<ClusterConfig>, status: PeerStatus) -> StatusReply {
        StatusReply {
            node: n(node),
            identity: NodeIdentity::generate(),
            config,
            status,
            awaiting: None,
            joining: BTreeSet::new(),
        }
    }

    fn replies(list: Vec<StatusReply>) -> BTreeMap<NodeName, StatusReply> {
        list.into_iter().map(|r| (r.node.clone(), r)).collect()
    }

    #[test]
    fn test_all_coeval_or_preboot() {
        let ours = config(2, &["a", "b", "c"]);
        let replies = replies(vec![
            reply("b", Some(ours.clone()), PeerStatus::Rejoining),
            reply("c", None, PeerStatus::Preboot),
        ]);
        assert_eq!(classify_configs(&ours, &replies), ConfigVerdict::Coeval);
    }

    #[test]
    fn test_younger_wins_over_older() {
        let ours = config(2, &["a", "b", "c"]);
        let replies = replies(vec![
            reply("b", Some(config(1, &["a", "b"])), PeerStatus::Rejoining),
            reply("c", Some(config(4, &["a", "c"])), PeerStatus::Running),
            reply("d", Some(config(3, &["a", "d"])), PeerStatus::Running),
        ]);
        assert_eq!(
            classify_configs(&ours, &replies),
            ConfigVerdict::Younger(config(4, &["a", "c"]))
        );
    }

    #[test]
    fn test_older_peers_are_collected() {
        let ours = config(2, &["a", "b", "c"]);
        let replies = replies(vec![
            reply("b", Some(config(1, &["a", "b"])), PeerStatus::Rejoining),
            reply("c", Some(ours.clone()), PeerStatus::Rejoining),
        ]);
        assert_eq!(
            classify_configs(&ours, &replies),
            ConfigVerdict::Older(set(&["b"]))
        );
    }

    #[test]
    fn test_disagreement_is_invalid() {
        let ours = config(2, &["a", "b"]);
        let same_version = replies(vec![reply(
            "b",
            Some(config(2, &["a", "c"])),
            PeerStatus::Rejoining,
        )]);
        assert_eq!(
            classify_configs(&ours, &same_version),
            ConfigVerdict::Invalid
        );

        let younger_disagree = replies(vec![
            reply("b", Some(config(3, &["a", "b"])), PeerStatus::Running),
            reply("c", Some(config(3, &["a", "c"])), PeerStatus::Running),
        ]);
        assert_eq!(
            classify_configs(&ours, &younger_disagree),
            ConfigVerdict::Invalid
        );
    }

    #[test]
    fn test_joining_nodes_unions_reports() {
        let mut from_b = reply("b", None, PeerStatus::Rejoining);
        from_b.joining = set(&["d"]);
        let replies = replies(vec![from_b, reply("c", None, PeerStatus::Joining)]);

        assert_eq!(joining_nodes(&replies), set(&["c", "d"]));
    }

    #[test]
    fn test_dependency_set_excludes_local_and_joining() {
        let config = config(1, &["a", "b", "c", "d"]);
        let status = ClusterStatus {
            all: set(&["a", "b", "c", "d", "e"]),
            disk: set(&["a", "b", "c", "e"]),
            running: set(&["a", "b", "c", "d", "e"]),
        };

        let deps = dependency_set(&n("a"), &config, &status, &set(&["c"]));
        assert_eq!(deps, set(&["b"]));
    }

    #[test]
    fn test_rejoining_peers() {
        let replies = replies(vec![
            reply("b", None, PeerStatus::Rejoining),
            reply("c", None, PeerStatus::Preboot),
        ]);
        assert_eq!(rejoining_peers(&set(&["b", "c", "d"]), &replies), set(&["b"]));
    }
}
