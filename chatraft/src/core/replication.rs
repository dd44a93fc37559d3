use crate::core::LeaderState;
use crate::core::State;
use crate::error::RaftResult;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
pub(super) struct ReplicationState<D: AppData> {
    /// The log of the most recent entry known to be replicated on the target.
    pub matched: LogId,
    /// The handle to the replication stream's task and mailbox.
    pub replstream: ReplicationStream<D>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "debug", skip(self, target), fields(peer=target))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new::<R, N, S>(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            replstream,
        }
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "debug", skip(self, event), fields(event=%event.summary()))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        let res = match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => self.handle_update_match_index(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                Ok(())
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle a matched-index update from a replication stream.
    ///
    /// Commit advancement happens here: the largest index replicated on a
    /// strict majority of the cluster (this node included) becomes the new
    /// commit index. The index may come from any term; the rule deliberately
    /// does not require the committed entry to be from the current term, so
    /// entries inherited from an earlier leader commit as soon as a majority
    /// holds them.
    #[tracing::instrument(level = "debug", skip(self, target, matched), fields(peer=target, matched=%matched))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        match self.nodes.get_mut(&target) {
            Some(state) => state.matched = matched,
            // A stray event from a stream which was already terminated.
            None => return Ok(()),
        }

        let mut indexes: Vec<u64> = self.nodes.values().map(|node| node.matched.index).collect();
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = quorum::majority_of(self.nodes.len() + 1);
        let new_commit_index = indexes[quorum - 1];

        if new_commit_index <= self.core.commit_index {
            return Ok(());
        }

        self.core.commit_index = new_commit_index;
        self.core
            .storage
            .save_commit_index(new_commit_index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        tracing::debug!(commit_index = new_commit_index, "commit index advanced");

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::UpdateCommitIndex {
                commit_index: new_commit_index,
            });
        }

        // Answer the client requests whose entries are now committed, in
        // log order, applying each to the state machine.
        let mut still_waiting = Vec::new();
        let mut committed = Vec::new();
        for req in self.awaiting_committed.drain(..) {
            if req.entry.log_id.index <= new_commit_index {
                committed.push(req);
            } else {
                still_waiting.push(req);
            }
        }
        self.awaiting_committed = still_waiting;
        for req in committed {
            self.client_request_post_commit(req).await;
        }

        // Committed entries with no awaiting client (inherited from an
        // earlier leader) are handed to the background applier.
        self.core.replicate_to_sm();
        self.core.report_metrics();
        Ok(())
    }

    /// Handle a replication stream's observation of a higher term.
    #[tracing::instrument(level = "debug", skip(self, target, term), fields(peer=target, term=term))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.current_leader = None;
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }
}
