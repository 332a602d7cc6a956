//! Shared harness for multi-node rejoin tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proven_clusterer::{ClusterStatus, PeerStatus, RejoinConfig, RejoinCoordinator, RejoinResult};
use proven_clusterer_memory::{MemoryMessaging, MemoryNetwork, MemoryStorage};
use proven_topology::{ClusterConfig, ClusterNode, Gospel, NodeIdentity, NodeName, ShutdownTimeout};
use tokio::task::JoinHandle;

pub type Coordinator = RejoinCoordinator<MemoryMessaging, MemoryStorage>;

pub struct TestNode {
    pub coordinator: Coordinator,
    pub storage: Arc<MemoryStorage>,
}

/// A set of nodes sharing one in-memory network.
pub struct TestCluster {
    pub network: MemoryNetwork,
    nodes: BTreeMap<NodeName, TestNode>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Register `name`, whose storage last recorded `running` as up under
    /// `config`.
    pub fn add_node(&mut self, name: &str, config: &ClusterConfig, running: &[&str]) -> Coordinator {
        let storage = MemoryStorage::from_config(config, running.iter().copied().map(NodeName::new));
        self.add_node_with_status(name, storage)
    }

    pub fn add_node_with_status(&mut self, name: &str, storage: MemoryStorage) -> Coordinator {
        let storage = Arc::new(storage);
        let coordinator = RejoinCoordinator::new(
            self.network.messaging(name),
            storage.clone(),
            NodeIdentity::generate(),
            settings(),
        );
        self.network.register(name, Arc::new(coordinator.clone()));
        self.nodes.insert(
            NodeName::new(name),
            TestNode {
                coordinator: coordinator.clone(),
                storage,
            },
        );
        coordinator
    }

    pub fn node(&self, name: &str) -> &TestNode {
        &self.nodes[&NodeName::new(name)]
    }

    pub fn coordinator(&self, name: &str) -> Coordinator {
        self.node(name).coordinator.clone()
    }

    pub fn storage(&self, name: &str) -> Arc<MemoryStorage> {
        self.node(name).storage.clone()
    }

    /// Start a rejoin of `name` under `config` in the background.
    pub fn spawn_run(
        &self,
        name: &str,
        config: &ClusterConfig,
    ) -> JoinHandle<proven_clusterer::Result<RejoinResult>> {
        let coordinator = self.coordinator(name);
        let config = config.clone();
        tokio::spawn(async move { coordinator.run(config).await })
    }

    /// Wait until `name` reports `status`, polling.
    pub async fn wait_for_status(&self, name: &str, status: PeerStatus, within: Duration) -> bool {
        let coordinator = self.coordinator(name);
        tokio::time::timeout(within, async {
            while coordinator.status() != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

pub fn settings() -> RejoinConfig {
    RejoinConfig::default()
        .with_retry_interval(Duration::from_millis(20))
        .with_request_timeout(Duration::from_millis(500))
}

pub fn n(name: &str) -> NodeName {
    NodeName::new(name)
}

/// A config of disk nodes with `gospel` as the gospel node.
pub fn disk_config(version: u64, nodes: &[&str], gospel: &str) -> ClusterConfig {
    ClusterConfig::new(
        version,
        nodes.iter().copied().map(ClusterNode::disk).collect(),
        Gospel::Node(n(gospel)),
        ShutdownTimeout::Infinite,
    )
    .expect("valid config")
}

pub fn empty_status() -> ClusterStatus {
    ClusterStatus::default()
}

/// Await a spawned rejoin, failing the test if it takes too long.
pub async fn finish(
    handle: JoinHandle<proven_clusterer::Result<RejoinResult>>,
    within: Duration,
) -> proven_clusterer::Result<RejoinResult> {
    tokio::time::timeout(within, handle)
        .await
        .expect("rejoin did not finish in time")
        .expect("rejoin task panicked")
}
