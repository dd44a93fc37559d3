//! The core logic of a Raft node.

mod append_entries;
mod client;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::ClientRequestEntry;
use crate::core::replication::ReplicationState;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::NodeStatus;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The core type implementing the Raft protocol.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The IDs of every other member of the cluster.
    ///
    /// The membership is static for the life of the process; majorities are
    /// always computed over `peers` plus this node.
    peers: BTreeSet<NodeId>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// The definition of a committed log is that the leader which has created the log has
    /// successfully replicated the log to a majority of the cluster. This value is updated via
    /// AppendEntries RPC from the leader, or if a node is the leader, it will update this value
    /// as new entries have been successfully replicated to a majority of the cluster.
    ///
    /// This value is persisted and restored on startup, clamped to the last
    /// index actually present in the log.
    commit_index: u64,

    /// The index of the highest log entry which has been applied to the local state machine.
    ///
    /// Is initialized to the value recorded by the storage layer, which
    /// advances it inside the same transaction as each application.
    last_applied: u64,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally based on
    /// the leader's term which is communicated to other members via the AppendEntries protocol,
    /// but this may also be incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// The stream of join handles from state machine application tasks. There will only ever be
    /// a maximum of 1 element at a time.
    ///
    /// This abstraction is needed to ensure that applying entries to the state machine does not
    /// block the AppendEntries RPC flow, while entries are still applied in strict index order.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<u64>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        peers: BTreeSet<NodeId>,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id,
            peers,
            config,
            network,
            storage,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_applied = state.last_applied;
        // The durable commit index can never point past the log itself.
        self.commit_index = state.commit_index.min(self.last_log_id.index);

        self.update_next_election_timeout(false);

        // Catch up the state machine with anything committed before the last shutdown.
        self.replicate_to_sm();
        self.report_metrics();

        // This is central loop of the system. The Raft core assumes a few different roles based
        // on cluster state. The Raft core will delegate control to the different state
        // controllers and simply awaits the delegated loop to return, which will only take place
        // if some error has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = crate::storage::HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use this
    /// interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Spawn a background task applying committed-but-unapplied entries to the state machine.
    ///
    /// At most one task is in flight at a time; entries are applied in
    /// strict index order. Completion is observed through
    /// `replicate_to_sm_handle` in the role loops, which re-triggers this
    /// method until the state machine has caught up with the commit index.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn replicate_to_sm(&mut self) {
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        if self.last_applied >= self.commit_index {
            return;
        }
        let start = self.last_applied + 1;
        let stop = self.commit_index;
        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let entries = storage.get_log_entries(start..=stop).await?;
                let last_index = entries.last().map(|e| e.log_id.index);
                if !entries.is_empty() {
                    let refs: Vec<_> = entries.iter().collect();
                    storage.apply_to_state_machine(&refs).await?;
                }
                Ok(last_index)
            }
            .instrument(tracing::debug_span!("replicate_to_sm")),
        );
        self.replicate_to_sm_handle.push(handle);
    }

    /// Handle the output of an async task applying entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<u64>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last_applied) = last_applied_opt {
            if last_applied > self.last_applied {
                self.last_applied = last_applied;
            }
        }
        self.report_metrics();
        // Keep going if the commit index moved while the task was running.
        self.replicate_to_sm();
        Ok(())
    }

    /// Wait out any in-flight state machine application task.
    ///
    /// Called before a synchronous apply on the leader's client-write path
    /// so that no entry can ever be applied twice.
    pub(self) async fn flush_replicate_to_sm(&mut self) -> RaftResult<()> {
        while let Some(res) = self.replicate_to_sm_handle.next().await {
            match res {
                Ok(task_res) => {
                    let last_applied_opt = task_res.map_err(|err| self.map_fatal_storage_error(err))?;
                    if let Some(last_applied) = last_applied_opt {
                        if last_applied > self.last_applied {
                            self.last_applied = last_applied;
                        }
                    }
                }
                Err(err) => {
                    return Err(self.map_fatal_storage_error(err.into()));
                }
            }
        }
        Ok(())
    }

    /// Reject a client write request as this node is not the leader.
    ///
    /// The typed error carries the command back to the caller along with the
    /// current leader hint, so the caller can redirect.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(req.command, self.current_leader)));
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,

    /// A buffer of client requests which have been appended locally and are awaiting to be committed to the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry<D, R>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams. The initial heartbeat each stream sends
        // establishes this leader's authority with its followers.
        let targets: Vec<_> = self.core.peers.iter().copied().collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id);
        self.core.report_metrics();

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);

                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                // Nothing can be promised about entries this leader appended
                // but never saw committed.
                for req in self.awaiting_committed.drain(..) {
                    let _ = req.tx.send(Err(ClientWriteError::CommitUncertain));
                }
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.handle_client_write_request(rpc, tx).await;
                        }
                    }
                },
                Some(event) = self.replication_rx.recv() => {
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The number of votes which have been granted to this candidate.
    votes_granted: usize,
    /// The number of votes needed in order to become the Raft leader.
    votes_needed: usize,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup initial state per term. We vote for ourselves, and the
            // majority is always over the full configured cluster.
            self.votes_granted = 1;
            self.votes_needed = crate::quorum::majority_of(self.core.peers.len() + 1);

            // Setup new term.
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.current_leader = None;
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::info!(term = self.core.current_term, "starting election");

            // A cluster with no peers has its majority the moment this node
            // votes for itself.
            if self.votes_granted >= self.votes_needed {
                tracing::info!(term = self.core.current_term, "transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // This election has timed-out. Break to outer loop, which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some(msg) = self.core.rx_api.recv() => {
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                        }
                    },
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();

        // The discovery probe: periodically ask peers for their status so an
        // established leader is adopted without waiting out an election. The
        // probes run on their own tasks and report back over this channel.
        let mut probe_interval = tokio::time::interval(Duration::from_millis(self.core.config.probe_interval));
        let (probe_tx, mut probe_rx) = mpsc::channel::<NodeStatus>(self.core.peers.len().max(1));

        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // Value is updated as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => {
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                    }
                },
                _ = probe_interval.tick() => self.spawn_status_probes(probe_tx.clone()),
                Some(status) = probe_rx.recv() => self.handle_peer_status(status).await?,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Probe every peer with the status RPC, reporting results over `tx`.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn spawn_status_probes(&self, tx: mpsc::Sender<NodeStatus>) {
        let ttl = Duration::from_millis(self.core.config.rpc_timeout);
        for peer in self.core.peers.iter().copied() {
            let network = self.core.network.clone();
            let tx = tx.clone();
            let _ = tokio::spawn(
                async move {
                    match tokio::time::timeout(ttl, network.send_status(peer)).await {
                        Ok(Ok(status)) => {
                            let _ = tx.send(status).await;
                        }
                        Ok(Err(err)) => tracing::debug!(peer = peer, error=%err, "status probe failed"),
                        Err(_) => tracing::debug!(peer = peer, "status probe timed out"),
                    }
                }
                .instrument(tracing::debug_span!("status_probe", peer = peer)),
            );
        }
    }

    /// Act on a peer's status report.
    ///
    /// A peer which reports itself leader at our term or above is adopted as
    /// the current leader, and the election timer is re-armed. This is only
    /// an eagerness hint: terms are still advanced through the standard
    /// persist-first path, and no vote or log state is touched.
    #[tracing::instrument(level = "trace", skip(self, status))]
    async fn handle_peer_status(&mut self, status: NodeStatus) -> RaftResult<()> {
        if !status.state.is_leader() {
            return Ok(());
        }
        if status.current_term < self.core.current_term {
            return Ok(());
        }
        if status.current_term > self.core.current_term {
            self.core.update_current_term(status.current_term, None);
            self.core.save_hard_state().await?;
        }
        if self.core.current_leader != Some(status.id) {
            tracing::info!(leader = status.id, term = status.current_term, "discovered established leader");
        }
        self.core.current_leader = Some(status.id);
        self.core.update_next_election_timeout(false);
        self.core.report_metrics();
        Ok(())
    }
}
