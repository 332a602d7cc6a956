use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use proven_clusterer::PeerHandler;
use proven_locks_memory::MemoryLockManager;
use proven_topology::NodeName;
use tracing::{debug, info};

use crate::messaging::MemoryMessaging;

struct NetworkInner {
    handlers: DashMap<NodeName, Arc<dyn PeerHandler>>,
    down: DashSet<NodeName>,
    cut: DashSet<(NodeName, NodeName)>,
    locks: MemoryLockManager,
    delivered: AtomicUsize,
}

/// Routes messages between nodes registered in the same process.
///
/// Nodes can be taken down and links cut to simulate crashes and
/// partitions. Node locks live in one table shared by every node.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.inner.handlers.len())
            .field("down", &self.inner.down.len())
            .field("held_locks", &self.inner.locks.held_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                handlers: DashMap::new(),
                down: DashSet::new(),
                cut: DashSet::new(),
                locks: MemoryLockManager::new("network"),
                delivered: AtomicUsize::new(0),
            }),
        }
    }

    /// A messaging handle sending from `node`
    pub fn messaging(&self, node: impl Into<NodeName>) -> MemoryMessaging {
        let node = node.into();
        let locks = self.inner.locks.with_owner(node.as_str());
        MemoryMessaging::new(self.clone(), node, locks)
    }

    /// Deliver requests and casts for `node` to `handler`
    pub fn register(&self, node: impl Into<NodeName>, handler: Arc<dyn PeerHandler>) {
        let node = node.into();
        info!(%node, "node registered");
        self.inner.handlers.insert(node, handler);
    }

    /// Stop delivering to `node`
    pub fn deregister(&self, node: &NodeName) {
        info!(%node, "node deregistered");
        self.inner.handlers.remove(node);
    }

    /// Take `node` down or bring it back up
    pub fn set_reachable(&self, node: &NodeName, reachable: bool) {
        debug!(%node, reachable, "changing node reachability");
        if reachable {
            self.inner.down.remove(node);
        } else {
            self.inner.down.insert(node.clone());
        }
    }

    /// Cut the link between `a` and `b` in both directions
    pub fn partition(&self, a: &NodeName, b: &NodeName) {
        debug!(%a, %b, "cutting link");
        self.inner.cut.insert(link(a, b));
    }

    /// Restore the link between `a` and `b`
    pub fn heal(&self, a: &NodeName, b: &NodeName) {
        debug!(%a, %b, "healing link");
        self.inner.cut.remove(&link(a, b));
    }

    /// Whether a message from `from` would reach `to`
    #[must_use]
    pub fn can_reach(&self, from: &NodeName, to: &NodeName) -> bool {
        self.inner.handlers.contains_key(to)
            && !self.inner.down.contains(from)
            && !self.inner.down.contains(to)
            && !self.inner.cut.contains(&link(from, to))
    }

    /// Messages delivered so far
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Node locks currently held by anyone
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.inner.locks.held_count()
    }

    pub(crate) fn route(&self, from: &NodeName, to: &NodeName) -> Option<Arc<dyn PeerHandler>> {
        if !self.can_reach(from, to) {
            return None;
        }
        let handler = self.inner.handlers.get(to).map(|entry| entry.value().clone())?;
        self.inner.delivered.fetch_add(1, Ordering::SeqCst);
        Some(handler)
    }
}

fn link(a: &NodeName, b: &NodeName) -> (NodeName, NodeName) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
