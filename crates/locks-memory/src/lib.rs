//! In-memory implementation of locks shared by every manager cloned from
//! the same table, for tests and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod guard;

pub use error::Error;
pub use guard::MemoryLockGuard;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_locks::{LockManager, LockStatus};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct Holder {
    owner: String,
    count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<String, Holder>>,
    released: Notify,
}

impl LockTable {
    fn try_acquire(&self, resource_id: &str, owner: &str) -> bool {
        let mut held = self.held.lock();
        match held.get_mut(resource_id) {
            Some(holder) if holder.owner == owner => {
                holder.count += 1;
                true
            }
            Some(_) => false,
            None => {
                held.insert(
                    resource_id.to_string(),
                    Holder {
                        owner: owner.to_string(),
                        count: 1,
                    },
                );
                true
            }
        }
    }

    pub(crate) fn release(&self, resource_id: &str, owner: &str) {
        let mut held = self.held.lock();
        let freed = match held.get_mut(resource_id) {
            Some(holder) if holder.owner == owner => {
                holder.count -= 1;
                holder.count == 0
            }
            _ => false,
        };
        if freed {
            held.remove(resource_id);
            drop(held);
            self.released.notify_waiters();
        }
    }
}

/// In-memory lock manager.
///
/// Managers created with [`MemoryLockManager::with_owner`] share the lock
/// table of the manager they were created from.
#[derive(Clone, Debug)]
pub struct MemoryLockManager {
    table: Arc<LockTable>,
    owner: String,
}

impl MemoryLockManager {
    /// Creates a manager with a fresh lock table.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            owner: owner.into(),
        }
    }

    /// Creates a manager for another owner over the same lock table.
    #[must_use]
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            table: self.table.clone(),
            owner: owner.into(),
        }
    }

    /// Number of resources currently held by any owner.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }

    fn acquire(&self, resource_id: &str) -> Result<Option<MemoryLockGuard>, Error> {
        if resource_id.is_empty() {
            return Err(Error::EmptyResourceId);
        }

        if self.table.try_acquire(resource_id, &self.owner) {
            debug!(resource_id, owner = %self.owner, "lock acquired");
            Ok(Some(MemoryLockGuard::new(
                self.table.clone(),
                resource_id.to_string(),
                self.owner.clone(),
            )))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;
    type Guard = MemoryLockGuard;

    fn owner(&self) -> &str {
        &self.owner
    }

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        let held = self.table.held.lock();
        Ok(match held.get(&resource_id) {
            None => LockStatus::Free,
            Some(holder) if holder.owner == self.owner => LockStatus::HeldBySelf,
            Some(holder) => LockStatus::HeldByOther(holder.owner.clone()),
        })
    }

    async fn lock(&self, resource_id: String) -> Result<Self::Guard, Self::Error> {
        loop {
            // Register before checking so a release in between is not missed.
            let released = self.table.released.notified();
            if let Some(guard) = self.acquire(&resource_id)? {
                return Ok(guard);
            }
            debug!(%resource_id, owner = %self.owner, "lock busy, waiting for release");
            released.await;
        }
    }

    async fn try_lock(&self, resource_id: String) -> Result<Option<Self::Guard>, Self::Error> {
        self.acquire(&resource_id)
    }
}
