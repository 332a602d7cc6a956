//! Error types for the rejoin procedure

use proven_topology::{ClusterConfig, TopologyError};
use thiserror::Error;

/// Result type for rejoin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rejoin errors
#[derive(Debug, Error)]
pub enum Error {
    /// Peers disagree on what this config version contains
    #[error("invalid cluster config: peers disagree on version {}", .0.version())]
    InvalidConfig(Box<ClusterConfig>),

    /// The config does not fit the local node
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A storage-layer call failed
    #[error("storage error: {0}")]
    Storage(String),

    /// A replacement config was older than the one in use
    #[error("config regression from version {current} to {offered}")]
    ConfigRegression {
        /// Version in use
        current: u64,
        /// Version offered as a replacement
        offered: u64,
    },

    /// Another rejoin is already running on this node
    #[error("rejoin already running")]
    AlreadyRunning,

    /// The session event channel closed unexpectedly
    #[error("rejoin session closed")]
    SessionClosed,
}

impl Error {
    pub(crate) fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string())
    }
}
