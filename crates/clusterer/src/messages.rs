//! Messages exchanged between peers during rejoin

use std::collections::BTreeSet;

use proven_topology::{ClusterConfig, NodeIdentity, NodeName};
use serde::{Deserialize, Serialize};

/// What a node reports itself to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Started, but not yet handed a config
    Preboot,
    /// Running the fresh-join procedure
    Joining,
    /// Running the rejoin procedure
    Rejoining,
    /// A full cluster member
    Running,
}

/// Reply to [`PeerRequest::Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// The replying node
    pub node: NodeName,
    /// The replying node's current identity
    pub identity: NodeIdentity,
    /// The replying node's config, absent in preboot
    pub config: Option<ClusterConfig>,
    /// What the replying node is doing
    pub status: PeerStatus,
    /// Nodes the replying node waits on, if it is rejoining
    pub awaiting: Option<BTreeSet<NodeName>>,
    /// Nodes the replying node believes are fresh-joining
    pub joining: BTreeSet<NodeName>,
}

/// Reply to [`PeerRequest::Awaiting`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwaitingReply {
    /// The replying node is rejoining and waits on these nodes
    Awaiting(BTreeSet<NodeName>),
    /// The replying node is not rejoining
    NotRejoining,
}

/// Request sent with [`Messaging::multicall`](crate::Messaging::multicall).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Ask for the peer's status, announcing our own identity
    Status {
        /// The requesting node
        from: NodeName,
        /// The requesting node's current identity
        identity: NodeIdentity,
    },
    /// Ask for the set of nodes the peer waits on
    Awaiting,
}

/// Reply to a [`PeerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    /// Reply to a status request
    Status(StatusReply),
    /// Reply to an awaiting request
    Awaiting(AwaitingReply),
}

/// One-way message sent with [`Messaging::multicast`](crate::Messaging::multicast).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerCast {
    /// A peer is pushing its config
    NewConfig {
        /// The pushing node
        from: NodeName,
        /// The pushed config
        config: ClusterConfig,
    },
}
