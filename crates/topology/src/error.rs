//! Error types for cluster configuration handling

use std::fmt;

use thiserror::Error as ThisError;

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Topology-related errors
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum TopologyError {
    /// A config failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The local node is not named by the config it was handed
    #[error("node {0} is not a member of the cluster config")]
    NotAMember(String),
}

/// The config field a validation failure refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigField {
    /// `version`
    Version,
    /// `nodes`
    Nodes,
    /// `gospel`
    Gospel,
    /// `shutdown_timeout`
    ShutdownTimeout,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Version => "version",
            Self::Nodes => "nodes",
            Self::Gospel => "gospel",
            Self::ShutdownTimeout => "shutdown_timeout",
        };
        f.write_str(name)
    }
}

/// A single config validation failure.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    /// The offending field
    pub field: ConfigField,
    /// Human readable explanation
    pub reason: String,
}

impl ConfigError {
    /// Create a new validation error for `field`
    pub fn new(field: ConfigField, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
