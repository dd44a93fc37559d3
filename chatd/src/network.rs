//! `RaftNetwork` over the TCP wire protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use chatraft::raft::AppendEntriesRequest;
use chatraft::raft::AppendEntriesResponse;
use chatraft::raft::VoteRequest;
use chatraft::raft::VoteResponse;
use chatraft::LogId;
use chatraft::NodeId;
use chatraft::NodeStatus;
use chatraft::RaftNetwork;
use sqlstore::ChatCommand;

use crate::wire;
use crate::wire::Envelope;
use crate::wire::Request;
use crate::wire::Response;
use crate::wire::WireEntry;

/// The peer-facing network: one short-lived connection per RPC, each call
/// bounded by the configured deadline. Expiry and connection failures are
/// ordinary transport errors which the consensus engine retries on its own
/// cadence.
pub struct ChatNetwork {
    peers: BTreeMap<NodeId, String>,
    rpc_timeout: Duration,
}

impl ChatNetwork {
    pub fn new(peers: BTreeMap<NodeId, String>, rpc_timeout: Duration) -> Self {
        Self { peers, rpc_timeout }
    }

    async fn call(&self, target: NodeId, request: Request) -> Result<Response> {
        let addr = self.peers.get(&target).ok_or_else(|| anyhow!("unknown peer {}", target))?.clone();
        let res = timeout(self.rpc_timeout, async move {
            let stream = TcpStream::connect(&addr).await.with_context(|| format!("connecting to {}", addr))?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            wire::send(
                &mut framed,
                &Envelope {
                    username: None,
                    forwarded: false,
                    request,
                },
            )
            .await?;
            match wire::recv::<Response, _>(&mut framed).await? {
                Some(response) => Ok(response),
                None => Err(anyhow!("connection closed before response")),
            }
        })
        .await;
        match res {
            Ok(inner) => inner,
            Err(_) => Err(anyhow!("rpc to node {} timed out", target)),
        }
    }
}

#[async_trait]
impl RaftNetwork<ChatCommand> for ChatNetwork {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<ChatCommand>) -> Result<AppendEntriesResponse> {
        let entries = rpc
            .entries
            .iter()
            .map(WireEntry::encode)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("encoding log entries for the wire")?;
        let request = Request::AppendEntries {
            term: rpc.term,
            leader_id: rpc.leader_id,
            prev_log_index: rpc.prev_log_id.index,
            prev_log_term: rpc.prev_log_id.term,
            entries,
            leader_commit: rpc.leader_commit,
        };
        match self.call(target, request).await? {
            Response::Appended {
                term,
                success,
                match_index,
            } => Ok(AppendEntriesResponse {
                term,
                success,
                match_index,
            }),
            Response::Error(err) => bail!("peer rejected AppendEntries: {}", err),
            other => bail!("unexpected response to AppendEntries: {:?}", other),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let request = Request::RequestVote {
            term: rpc.term,
            candidate_id: rpc.candidate_id,
            last_log_index: rpc.last_log_index,
            last_log_term: rpc.last_log_term,
        };
        match self.call(target, request).await? {
            Response::Vote { term, vote_granted } => Ok(VoteResponse { term, vote_granted }),
            Response::Error(err) => bail!("peer rejected RequestVote: {}", err),
            other => bail!("unexpected response to RequestVote: {:?}", other),
        }
    }

    async fn send_status(&self, target: NodeId) -> Result<NodeStatus> {
        match self.call(target, Request::Status).await? {
            Response::Status(status) => Ok(status),
            Response::Error(err) => bail!("peer rejected Status: {}", err),
            other => bail!("unexpected response to Status: {:?}", other),
        }
    }
}

/// Rebuild the engine-level AppendEntries request from its wire form.
pub fn append_entries_from_wire(
    term: u64,
    leader_id: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: &[WireEntry],
    leader_commit: u64,
) -> std::result::Result<AppendEntriesRequest<ChatCommand>, sqlstore::CommandDecodeError> {
    let entries = entries.iter().map(WireEntry::decode).collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(AppendEntriesRequest {
        term,
        leader_id,
        prev_log_id: LogId::new(prev_log_term, prev_log_index),
        entries,
        leader_commit,
    })
}
