//! Rejoin protocol for a restarting cluster node.
//!
//! When a node restarts it must decide, without a central authority, whether
//! it may resume membership on its own or must wait for the nodes it
//! depended on at last shutdown. This crate provides:
//! - The sans-I/O [`RejoinTransitioner`] state machine
//! - Dependency closure detection over who-waits-on-whom ([`DependencyGraph`])
//! - The [`RejoinCoordinator`] that drives transitioners over a [`Messaging`]
//!   implementation and answers peers through [`PeerHandler`]
//! - The [`StorageLayer`] collaborator the node's storage engine implements
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod analysis;
pub mod comms;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod messages;
pub mod rejoin;
pub mod storage;

pub use comms::{LockAcquisition, Messaging, MessagingError, Multicall, PeerHandler};
pub use config::RejoinConfig;
pub use coordinator::{RejoinCoordinator, RejoinResult};
pub use error::{Error, Result};
pub use graph::DependencyGraph;
pub use messages::{AwaitingReply, PeerCast, PeerReply, PeerRequest, PeerStatus, StatusReply};
pub use rejoin::{
    Command, Event, LockOutcome, Outcome, Phase, RejoinProgress, RejoinTransitioner, RetryToken,
    Round, Transition,
};
pub use storage::{ClusterStatus, StorageError, StorageLayer, discharge_dependencies};
