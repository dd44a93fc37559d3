//! Replication stream.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent<D>>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            storage,
            raft_core_tx,
        )
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. We always buffer until we receive a success response, then send the
/// next payload from the buffer.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent<D>>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The `RaftStorage` interface.
    storage: Arc<S>,

    /// The Raft's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// The index of the next log to send.
    ///
    /// This is initialized to leader's last log index + 1. Per the Raft protocol spec,
    /// this value may be decremented as new nodes enter the cluster and need to catch-up per the
    /// log consistency check.
    ///
    /// If a follower's log is inconsistent with the leader's, the AppendEntries consistency check
    /// will fail in the next AppendEntries RPC. After a rejection, the leader decrements
    /// `next_index` and retries the AppendEntries RPC. Eventually `next_index` will reach a point
    /// where the leader and follower logs match. When this happens, AppendEntries will succeed,
    /// which removes any conflicting entries in the follower's log and appends entries from the
    /// leader's log (if any). Once AppendEntries succeeds, the follower’s log is consistent with
    /// the leader's, and it will remain that way for the rest of the term.
    next_index: u64,
    /// The last known log to be successfully replicated on the target.
    ///
    /// This is initialized to the leader's last log id, and is probed
    /// backwards by the consistency check until leader and follower agree.
    matched: LogId,

    /// A buffer of data to replicate to the target follower.
    ///
    /// The buffered payload here will be expanded as more replication commands come in from the
    /// Raft node. Data from this buffer will flow into the `outbound_buffer` in chunks.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// A buffer of data which is being sent to the follower.
    ///
    /// Data in this buffer comes directly from the `replication_buffer` in chunks, and will
    /// remain here until it is confirmed that the payload has been successfully received by the
    /// target node. This allows for retransmission of payloads in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry<D>>,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,
    /// The deadline applied to each outbound RPC.
    rpc_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let rpc_timeout = Duration::from_millis(config.rpc_timeout);
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            target_state: TargetReplState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: last_log,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            rpc_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, peer=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial heartbeat; this is how a fresh leader
        // establishes its authority with this follower.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// The request is bounded by the configured RPC deadline; expiry is
    /// treated as an ordinary transport failure and the payload will be
    /// retried on a later cycle.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        // Build the frame to be sent to the follower.
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        // Send the payload.
        tracing::trace!("start sending append_entries, timeout: {:?}", self.rpc_timeout);
        let res = match timeout(self.rpc_timeout, self.network.send_append_entries(self.target, payload)).await {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };
        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        // Once we've successfully sent a payload of entries, don't send them again.
        self.outbound_buffer.clear();

        // Handle success conditions.
        if res.success {
            tracing::trace!("append entries succeeded to {:?}", last_log_id);

            if let Some(log_id) = last_log_id {
                self.next_index = log_id.index + 1; // This should always be the next expected index.
                self.matched = log_id;
            }
            // The follower holds everything through `matched`: the
            // consistency check at that position just passed. Report it so
            // the leader can advance the commit index, which also covers
            // entries inherited from earlier terms.
            let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
                target: self.target,
                matched: self.matched,
            });

            // If the target is far behind the tip of the log despite the
            // successful payload, fall back to paging from storage.
            let is_lagging = self
                .last_log_index
                .checked_sub(self.matched.index)
                .map(|diff| diff > self.config.replication_lag_threshold)
                .unwrap_or(false);
            if is_lagging {
                self.target_state = TargetReplState::Lagging;
            }
            return;
        }

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        // The follower rejected the consistency check: walk `next_index`
        // back one and let the lagging loop resend from storage.
        self.next_index = std::cmp::max(1, self.next_index.saturating_sub(1));
        if self.next_index <= 1 {
            self.matched = LogId::default();
            self.target_state = TargetReplState::Lagging;
            return;
        }
        match self.storage.try_get_log_entry(self.next_index - 1).await {
            Ok(Some(entry)) => {
                self.matched = entry.log_id;
            }
            Ok(None) => {
                // The log has no such entry; restart probing from the head.
                self.next_index = 1;
                self.matched = LogId::default();
            }
            Err(err) => {
                tracing::error!(error=?err, "error fetching log entry while resolving rejected AppendEntries");
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        }
        self.target_state = TargetReplState::Lagging;
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>) {
        let mut event_opt = Some(first);
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }

                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == TargetReplState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }

                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event) = self.repl_rx.recv().now_or_never() {
                event_opt = event;
            }
            iters += 1;
        }
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry<D: AppData> {
    /// An entry owned by an Arc, hot off the replication stream from the Raft leader.
    Arc(Arc<Entry<D>>),
    /// An entry which was fetched directly from storage.
    Raw(Entry<D>),
}

impl<D: AppData> AsRef<Entry<D>> for OutboundEntry<D> {
    fn as_ref(&self) -> &Entry<D> {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is lagging behind.
    Lagging,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log, so its
        /// index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent {
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The log of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex {
                ref target,
                ref matched,
            } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // When converting to `Lagging`, `outbound_buffer` and `replication_buffer` are
            // cleared, and there may be uncommitted logs in them. Thus when converting back to
            // line rate, when these two buffers are empty, we need to resend all unconfirmed
            // logs. Otherwise these logs would have no chance to be replicated, unless a new
            // log is written.
            let index = match next_buf_index {
                Some(i) => i,
                None => self.last_log_index + 1,
            };

            // Ensure that our buffered data matches up with `next_index`. When transitioning to
            // line rate, it is always possible that new data has been sent for replication but has
            // skipped this replication stream during transition. In such cases, a single update from
            // storage will put this stream back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }

                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => self.drain_raft_rx(event),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from lagging.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        if start >= stop {
            return;
        }
        let entries = match self.storage.get_log_entries(start..=stop - 1).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }

            // Prep entries from storage and send them off for replication.
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }
            self.prep_outbound_buffer_from_storage().await;
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            // An outbound buffer which survived the send means the payload
            // did not go through; pace the retry instead of spinning against
            // an unreachable peer.
            if !self.outbound_buffer.is_empty() {
                tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
            }

            // Check raft channel to ensure we are staying up-to-date, then loop.
            if let Some(Some(event)) = self.repl_rx.recv().now_or_never() {
                self.drain_raft_rx(event);
            }
        }
    }

    /// Check if this replication stream is now up-to-speed.
    #[tracing::instrument(level = "trace", skip(self))]
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload of entries to append.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        // If the send buffer is empty, we need to fill it.
        if self.outbound_buffer.is_empty() {
            // Determine an appropriate stop index for the storage fetch operation. Avoid underflow.
            //
            // Logs in storage:
            // 0 ... next_index ... commit_index ... last_uncommitted_index

            // Underflow is guarded against in the `is_up_to_speed` check in the outer loop.
            let distance_behind = self.commit_index - self.next_index;

            let is_within_payload_distance = distance_behind <= self.config.max_payload_entries;

            let stop_idx = if is_within_payload_distance {
                // If we have caught up to the line index, then that means we will be running at
                // line rate after this payload is successfully replicated.
                self.target_state = TargetReplState::LineRate; // Will continue in lagging state until the outer loop cycles.
                self.commit_index
            } else {
                self.next_index + self.config.max_payload_entries
            };

            // Bring the target up-to-date by fetching the largest possible payload of entries
            // from storage within the permitted configuration.
            let entries = match self.storage.get_log_entries(self.next_index..=stop_idx).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error=%err, "error fetching logs from storage");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            };

            self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
        }
    }
}
