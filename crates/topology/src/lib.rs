//! Cluster topology configuration for the clusterer.
//!
//! This crate provides:
//! - Node naming, roles and per-boot identities (`NodeName`, `NodeRole`, `NodeIdentity`)
//! - The versioned, immutable `ClusterConfig` and its validation
//! - Config lineage: comparison, identity-map merging and continuity detection
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod role;

pub use config::{
    ClusterConfig, ClusterConfigSpec, ConfigComparison, Gospel, GospelSpec, ShutdownTimeout,
    ShutdownTimeoutSpec, validate,
};
pub use error::{ConfigError, ConfigField, TopologyError};
pub use identity::{IdentityMap, LocalNode, NodeIdentity};
pub use node::{ClusterNode, NodeName, NodeSpec, normalize};
pub use role::NodeRole;
