//! Abstract interface for per-node mutual-exclusion locks.
//!
//! Locks are owned by the manager instance that took them and are released
//! when the returned guard is dropped, so an owner that goes away releases
//! everything it held without an explicit unlock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by another owner, identified by the String.
    HeldByOther(String),

    /// The lock is held by this manager's owner.
    HeldBySelf,
}

/// A lock manager with asynchronous operations.
///
/// Acquisition is re-entrant for the same owner: each successful call returns
/// its own guard and the resource is released once every guard is dropped.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// The guard type that releases the lock on drop.
    type Guard: Send + Sync + 'static;

    /// Identifier of the owner this manager acquires locks for.
    fn owner(&self) -> &str;

    /// Checks the status of a lock.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Acquires a lock, waiting until it becomes available.
    async fn lock(&self, resource_id: String) -> Result<Self::Guard, Self::Error>;

    /// Attempts to acquire a lock without waiting.
    ///
    /// Returns `Ok(None)` if the lock is held by another owner.
    async fn try_lock(&self, resource_id: String) -> Result<Option<Self::Guard>, Self::Error>;

    /// Attempts to acquire every lock in `resource_ids` without waiting.
    ///
    /// Resources are taken in ascending order, duplicates once. If any of
    /// them is held by another owner, the guards taken so far are dropped
    /// and `Ok(None)` is returned. Since every caller walks the same total
    /// order, no two callers can each hold a lock the other still needs.
    async fn try_lock_ordered(
        &self,
        mut resource_ids: Vec<String>,
    ) -> Result<Option<Vec<Self::Guard>>, Self::Error> {
        resource_ids.sort();
        resource_ids.dedup();

        let mut guards = Vec::with_capacity(resource_ids.len());
        for resource_id in resource_ids {
            match self.try_lock(resource_id).await? {
                Some(guard) => guards.push(guard),
                None => return Ok(None),
            }
        }

        Ok(Some(guards))
    }
}
