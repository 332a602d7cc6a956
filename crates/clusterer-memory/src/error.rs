use proven_clusterer::{MessagingError, StorageError};
use thiserror::Error;

/// Errors from the in-memory network and storage.
#[derive(Debug, Error)]
pub enum Error {
    /// A message could not be CBOR-encoded
    #[error("CBOR encode error: {0}")]
    Encode(String),

    /// A message could not be CBOR-decoded
    #[error("CBOR decode error: {0}")]
    Decode(String),

    /// The shared lock table refused an operation
    #[error(transparent)]
    Locks(#[from] proven_locks_memory::Error),

    /// The storage layer was switched to failing
    #[error("storage unavailable")]
    StorageUnavailable,
}

impl MessagingError for Error {}

impl StorageError for Error {}
