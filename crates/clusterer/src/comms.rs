//! Messaging collaborator seen from the rejoin procedure

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use proven_topology::NodeName;

use crate::messages::{PeerCast, PeerReply, PeerRequest};

/// Marker trait for `Messaging` errors
pub trait MessagingError: Debug + Error + Send + Sync + 'static {}

/// Outcome of a best-effort parallel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multicall<R> {
    /// Replies from the nodes that answered in time
    pub replies: BTreeMap<NodeName, R>,
    /// Nodes that did not answer in time
    pub unreachable: BTreeSet<NodeName>,
}

impl<R> Multicall<R> {
    /// A call in which nobody answered
    #[must_use]
    pub const fn all_unreachable(nodes: BTreeSet<NodeName>) -> Self {
        Self {
            replies: BTreeMap::new(),
            unreachable: nodes,
        }
    }
}

impl<R> Default for Multicall<R> {
    fn default() -> Self {
        Self::all_unreachable(BTreeSet::new())
    }
}

/// Outcome of [`Messaging::acquire_locks`].
#[derive(Debug)]
pub enum LockAcquisition<G> {
    /// Every lock is held until the guards are dropped
    Acquired(Vec<G>),
    /// Another owner holds one of the locks; nothing is held
    Rejected,
}

/// Point-to-point messaging and per-node locking.
#[async_trait]
pub trait Messaging: Clone + Send + Sync + 'static {
    /// The error type for messaging operations.
    type Error: MessagingError;

    /// Guard that releases one node lock on drop.
    type Guard: Send + Sync + 'static;

    /// Name of the node this handle sends from.
    fn local_node(&self) -> &NodeName;

    /// Send `request` to every node in `nodes` in parallel.
    ///
    /// Never waits longer than `timeout`; nodes that do not answer in time
    /// are reported in [`Multicall::unreachable`].
    async fn multicall(
        &self,
        nodes: BTreeSet<NodeName>,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<Multicall<PeerReply>, Self::Error>;

    /// Fire-and-forget `cast` to every node in `nodes`.
    ///
    /// Casts sent through the same handle to the same peer arrive in order.
    async fn multicast(
        &self,
        nodes: BTreeSet<NodeName>,
        cast: PeerCast,
    ) -> Result<(), Self::Error>;

    /// Take the lock of every node in `nodes`, in ascending name order.
    ///
    /// Unreachable nodes count as granted. Re-entrant for the local node.
    async fn acquire_locks(
        &self,
        nodes: BTreeSet<NodeName>,
    ) -> Result<LockAcquisition<Self::Guard>, Self::Error>;
}

/// Receiving side of [`Messaging`].
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// Answer a request from a peer
    async fn handle_request(&self, request: PeerRequest) -> PeerReply;

    /// Accept a one-way message from a peer
    async fn handle_cast(&self, cast: PeerCast);
}
