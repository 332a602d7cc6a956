use proven_locks::LockManagerError;
use thiserror::Error;

/// Errors that can occur when using the in-memory lock manager.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Resource ids must be non-empty.
    #[error("resource id must not be empty")]
    EmptyResourceId,
}

impl LockManagerError for Error {}
