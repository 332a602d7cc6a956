use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use proven_clusterer::{
    LockAcquisition, Messaging, Multicall, PeerCast, PeerReply, PeerRequest,
};
use proven_locks::LockManager;
use proven_locks_memory::{MemoryLockGuard, MemoryLockManager};
use proven_topology::NodeName;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::Error;
use crate::network::MemoryNetwork;

/// Per-node messaging handle over a [`MemoryNetwork`].
///
/// Every request, reply and cast is CBOR-encoded on send and decoded on
/// receipt, so only what survives the wire reaches a peer.
#[derive(Clone, Debug)]
pub struct MemoryMessaging {
    network: MemoryNetwork,
    node: NodeName,
    locks: MemoryLockManager,
}

impl MemoryMessaging {
    pub(crate) const fn new(
        network: MemoryNetwork,
        node: NodeName,
        locks: MemoryLockManager,
    ) -> Self {
        Self {
            network,
            node,
            locks,
        }
    }

    async fn call(&self, to: &NodeName, payload: &[u8]) -> Option<PeerReply> {
        let handler = self.network.route(&self.node, to)?;
        let request: PeerRequest = decode(payload)
            .inspect_err(|error| warn!(%to, %error, "dropping undecodable request"))
            .ok()?;

        let reply = handler.handle_request(request).await;
        let payload = encode(&reply)
            .inspect_err(|error| warn!(%to, %error, "dropping unencodable reply"))
            .ok()?;

        if !self.network.can_reach(to, &self.node) {
            return None;
        }
        decode(&payload).ok()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(value, &mut payload).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(payload)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Error> {
    ciborium::de::from_reader(payload).map_err(|e| Error::Decode(e.to_string()))
}

#[async_trait]
impl Messaging for MemoryMessaging {
    type Error = Error;
    type Guard = MemoryLockGuard;

    fn local_node(&self) -> &NodeName {
        &self.node
    }

    async fn multicall(
        &self,
        nodes: BTreeSet<NodeName>,
        request: PeerRequest,
        timeout: Duration,
    ) -> Result<Multicall<PeerReply>, Self::Error> {
        let payload = encode(&request)?;
        let payload = payload.as_slice();

        let calls = nodes.into_iter().map(|node| async move {
            let reply = tokio::time::timeout(timeout, self.call(&node, payload)).await;
            (node, reply.ok().flatten())
        });

        let mut multicall = Multicall::default();
        for (node, reply) in join_all(calls).await {
            match reply {
                Some(reply) => {
                    multicall.replies.insert(node, reply);
                }
                None => {
                    multicall.unreachable.insert(node);
                }
            }
        }

        debug!(
            from = %self.node,
            replies = multicall.replies.len(),
            unreachable = ?multicall.unreachable,
            "multicall complete"
        );
        Ok(multicall)
    }

    async fn multicast(
        &self,
        nodes: BTreeSet<NodeName>,
        cast: PeerCast,
    ) -> Result<(), Self::Error> {
        let payload = encode(&cast)?;

        // Delivered one peer at a time so casts to a peer keep their order.
        for node in nodes {
            let Some(handler) = self.network.route(&self.node, &node) else {
                debug!(from = %self.node, to = %node, "cast to unreachable node dropped");
                continue;
            };
            handler.handle_cast(decode(&payload)?).await;
        }

        Ok(())
    }

    async fn acquire_locks(
        &self,
        nodes: BTreeSet<NodeName>,
    ) -> Result<LockAcquisition<Self::Guard>, Self::Error> {
        let (reachable, skipped): (Vec<NodeName>, Vec<NodeName>) = nodes
            .into_iter()
            .partition(|node| *node == self.node || self.network.can_reach(&self.node, node));
        if !skipped.is_empty() {
            debug!(from = %self.node, ?skipped, "skipping locks of unreachable nodes");
        }

        let resource_ids = reachable.iter().map(ToString::to_string).collect();
        match self.locks.try_lock_ordered(resource_ids).await? {
            Some(guards) => Ok(LockAcquisition::Acquired(guards)),
            None => {
                debug!(from = %self.node, "node lock held elsewhere");
                Ok(LockAcquisition::Rejected)
            }
        }
    }
}
