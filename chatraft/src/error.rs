//! Error types exposed by this crate.

use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// The Raft node is shutting down.
    #[error("the raft node is shutting down")]
    ShuttingDown,
    /// An error which has come from the `RaftStorage` layer.
    ///
    /// Storage errors are unrecoverable: the node transitions to shutdown
    /// rather than continue with potentially divergent state.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    /// The write was submitted to a node which is not the leader.
    ///
    /// Carries the original command so the caller can forward it, plus the
    /// id of the current leader if one is known.
    #[error("this node is not the raft leader, forward the request to node {1:?}")]
    ForwardToLeader(D, Option<NodeId>),
    /// The leader could not confirm commitment of the write within the
    /// configured window; the write may or may not take effect.
    ///
    /// Callers must retry idempotently or accept at-least-once semantics.
    #[error("commit state of the request is unknown")]
    CommitUncertain,
    /// A Raft internal error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
}
