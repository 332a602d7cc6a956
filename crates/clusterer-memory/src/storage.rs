use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use proven_clusterer::{ClusterStatus, StorageLayer};
use proven_topology::{ClusterConfig, ClusterNode, NodeName};
use tracing::{debug, info};

use crate::error::Error;

/// A storage operation, as recorded by [`MemoryStorage::calls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    /// `force_load_tables`
    ForceLoad,
    /// `reset_cluster_status`
    ResetStatus,
    /// `read_cluster_status`
    ReadStatus,
    /// `wipe_and_reinitialize`
    Wipe,
    /// `configure_cluster_membership` with the node names given
    Configure(BTreeSet<NodeName>),
    /// `forget_nodes`
    Forget(BTreeSet<NodeName>),
}

#[derive(Debug, Default)]
struct StorageState {
    status: ClusterStatus,
    calls: Vec<StorageCall>,
    failing: bool,
}

/// Storage layer that keeps the recorded cluster status in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    /// Storage whose last shutdown recorded `status`
    #[must_use]
    pub fn new(status: ClusterStatus) -> Self {
        Self {
            state: Arc::new(Mutex::new(StorageState {
                status,
                ..StorageState::default()
            })),
        }
    }

    /// Storage that last ran as a member of `config` while `running` were up
    #[must_use]
    pub fn from_config(
        config: &ClusterConfig,
        running: impl IntoIterator<Item = NodeName>,
    ) -> Self {
        Self::new(ClusterStatus {
            all: config.node_names(),
            disk: config.disk_nodes(),
            running: running.into_iter().collect(),
        })
    }

    /// The currently recorded status
    #[must_use]
    pub fn cluster_status(&self) -> ClusterStatus {
        self.state.lock().status.clone()
    }

    /// Every operation performed so far, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<StorageCall> {
        self.state.lock().calls.clone()
    }

    /// Make every following operation fail, or succeed again
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    fn record(&self, call: StorageCall) -> Result<MutexGuard<'_, StorageState>, Error> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::StorageUnavailable);
        }
        state.calls.push(call);
        Ok(state)
    }
}

#[async_trait]
impl StorageLayer for MemoryStorage {
    type Error = Error;

    async fn force_load_tables(&self) -> Result<(), Self::Error> {
        self.record(StorageCall::ForceLoad)?;
        debug!("tables force-loaded");
        Ok(())
    }

    async fn reset_cluster_status(&self) -> Result<(), Self::Error> {
        self.record(StorageCall::ResetStatus)?.status.running.clear();
        Ok(())
    }

    async fn read_cluster_status(&self) -> Result<ClusterStatus, Self::Error> {
        Ok(self.record(StorageCall::ReadStatus)?.status.clone())
    }

    async fn wipe_and_reinitialize(&self) -> Result<(), Self::Error> {
        self.record(StorageCall::Wipe)?.status = ClusterStatus::default();
        info!("storage wiped");
        Ok(())
    }

    async fn configure_cluster_membership(
        &self,
        nodes: &[ClusterNode],
    ) -> Result<(), Self::Error> {
        let all: BTreeSet<NodeName> = nodes.iter().map(|node| node.name.clone()).collect();
        let mut state = self.record(StorageCall::Configure(all.clone()))?;
        state.status.disk = nodes
            .iter()
            .filter(|node| node.role.is_disk())
            .map(|node| node.name.clone())
            .collect();
        state.status.running.clone_from(&all);
        state.status.all = all;
        Ok(())
    }

    async fn forget_nodes(&self, nodes: &BTreeSet<NodeName>) -> Result<(), Self::Error> {
        let mut state = self.record(StorageCall::Forget(nodes.clone()))?;
        let status = &mut state.status;
        for node in nodes {
            status.all.remove(node);
            status.disk.remove(node);
            status.running.remove(node);
        }
        Ok(())
    }
}
