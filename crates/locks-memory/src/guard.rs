use std::sync::Arc;

use tracing::trace;

use crate::LockTable;

/// Guard for a lock held in a [`MemoryLockManager`](crate::MemoryLockManager).
///
/// Dropping the guard releases one hold on the resource.
#[derive(Debug)]
pub struct MemoryLockGuard {
    table: Arc<LockTable>,
    resource_id: String,
    owner: String,
}

impl MemoryLockGuard {
    pub(crate) const fn new(table: Arc<LockTable>, resource_id: String, owner: String) -> Self {
        Self {
            table,
            resource_id,
            owner,
        }
    }

    /// The locked resource
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        trace!(resource_id = %self.resource_id, owner = %self.owner, "releasing lock");
        self.table.release(&self.resource_id, &self.owner);
    }
}
