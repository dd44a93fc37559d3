//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::NodeStatus;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be hidden behind a
/// `Box<T>` or `Arc<T>` and this interface implemented on the `Box<T>` or
/// `Arc<T>`.
///
/// Peer unreachability is an ordinary error here: callers treat it as soft
/// and retry on the next heartbeat or replication cycle. Implementations
/// should apply a bounded deadline to every call.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Ask the target Raft node for its current status.
    ///
    /// Used by the follower-side discovery probe to adopt an established
    /// leader without waiting out an election timeout.
    async fn send_status(&self, target: NodeId) -> Result<NodeStatus>;
}
