use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// Grants are durable before the reply leaves this node: both the term
    /// update and the vote itself hit storage first.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(rpc=?msg))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=msg.candidate_id}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // If RPC's term is higher than current term, update term & become follower.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.current_leader = None;
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
            self.report_metrics();
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        let candidate_log_is_current = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !candidate_log_is_current {
            tracing::debug!(
                { candidate = msg.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // A node may vote for at most one candidate per term.
        match &self.voted_for {
            Some(candidate_id) if *candidate_id != msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            _ => {
                self.voted_for = Some(msg.candidate_id);
                self.save_hard_state().await?;
                // The candidate we voted for is the most plausible next
                // leader; adopt it as the redirect hint and hold off on
                // starting an election of our own.
                self.current_leader = Some(msg.candidate_id);
                self.update_next_election_timeout(false);
                self.report_metrics();
                tracing::debug!({candidate=msg.candidate_id, term=msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Spawn parallel vote requests to all cluster members.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let (tx, rx) = mpsc::channel(self.core.peers.len().max(1));
        let ttl = Duration::from_millis(self.core.config.rpc_timeout);
        for member in self.core.peers.iter().copied() {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_vote(member, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Ok(Err(err)) => tracing::warn!({error=%err, peer=member}, "error while requesting vote from peer"),
                        Err(_) => tracing::warn!({peer=member}, "timeout while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("send_vote", peer = member)),
            );
        }
        rx
    }

    /// Handle response from a vote request sent to a peer.
    #[tracing::instrument(level = "debug", skip(self, res, peer), fields(peer=peer))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, peer: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.current_leader = None;
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(term = self.core.current_term, "transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }
}
