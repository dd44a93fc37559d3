//! The Raft consensus engine driving the raftchat replicated state machine.
//!
//! This crate implements leader election, log replication, commit
//! advancement and command application over two application-provided seams:
//! a [`RaftStorage`] implementation owning the durable log, metadata and
//! state machine, and a [`RaftNetwork`] implementation carrying RPCs
//! between peers. All mutable Raft state lives on a single core task;
//! the cloneable [`Raft`] handle communicates with it over a mailbox.

mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
mod replication;
pub mod storage;

use std::fmt;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::core::State;
pub use crate::error::ClientWriteError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::NodeStatus;
pub use crate::raft::Raft;
pub use crate::storage::RaftStorage;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this
/// crate will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// goes through Raft. Instead, applications can present their data models
/// as-is to Raft, Raft will present it to the application's `RaftStorage`
/// impl when ready, and the application may then deal with the data
/// directly in the storage engine without having to do a preliminary
/// deserialization.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this
/// crate will be able to use their own concrete data types for returning
/// response data from the storage layer when an entry is applied to the
/// state machine as part of a client request (this is not used during
/// replication). This allows applications to seamlessly return application
/// specific data from their storage layer, up through Raft, and back into
/// their application for returning data to clients.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The identity of a log entry: the term in which the entry was created and
/// its index in the log.
///
/// `(0, 0)` denotes the position before the first entry of an empty log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A short, human-oriented rendering of a message, for logging.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
