//! In-memory messaging network and storage layer for running several
//! rejoining nodes inside one process, for tests and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod messaging;
mod network;
mod storage;

pub use error::Error;
pub use messaging::MemoryMessaging;
pub use network::MemoryNetwork;
pub use storage::{MemoryStorage, StorageCall};
