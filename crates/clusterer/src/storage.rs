//! Storage-layer collaborator

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use proven_topology::{ClusterNode, NodeName};
use tracing::debug;

/// Marker trait for `StorageLayer` errors
pub trait StorageError: Debug + Error + Send + Sync + 'static {}

/// Cluster membership as recorded by the storage layer at last shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Every node the storage layer knows about
    pub all: BTreeSet<NodeName>,
    /// Nodes holding persistent copies
    pub disk: BTreeSet<NodeName>,
    /// Nodes that were running
    pub running: BTreeSet<NodeName>,
}

/// Persistent storage owned by the local node.
#[async_trait]
pub trait StorageLayer: Send + Sync + 'static {
    /// The error type for storage operations.
    type Error: StorageError;

    /// Load tables without waiting for replicas on other nodes.
    async fn force_load_tables(&self) -> Result<(), Self::Error>;

    /// Forget which nodes were running at last shutdown.
    async fn reset_cluster_status(&self) -> Result<(), Self::Error>;

    /// Read membership as recorded at last shutdown.
    async fn read_cluster_status(&self) -> Result<ClusterStatus, Self::Error>;

    /// Discard all persistent state and start empty.
    async fn wipe_and_reinitialize(&self) -> Result<(), Self::Error>;

    /// Record `nodes` as the cluster membership.
    async fn configure_cluster_membership(
        &self,
        nodes: &[ClusterNode],
    ) -> Result<(), Self::Error>;

    /// Drop replica bookkeeping for `nodes` so nothing waits on them.
    async fn forget_nodes(&self, nodes: &BTreeSet<NodeName>) -> Result<(), Self::Error>;
}

/// Release the storage layer from waiting on any other node: load tables
/// unconditionally, forget the fresh-joining nodes and clear the recorded
/// running set.
pub async fn discharge_dependencies<S>(
    storage: &S,
    joining: &BTreeSet<NodeName>,
) -> Result<(), S::Error>
where
    S: StorageLayer + ?Sized,
{
    debug!(?joining, "discharging storage dependencies");
    storage.force_load_tables().await?;
    if !joining.is_empty() {
        storage.forget_nodes(joining).await?;
    }
    storage.reset_cluster_status().await
}
