//! The Raft storage interface and data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug, Default)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The highest log index known to be committed when the node last ran.
    pub commit_index: u64,
    /// The index of the last log applied to the state machine.
    pub last_applied: u64,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self::default()
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// An implementation owns the durable state of a node: the Raft log, the
/// Raft metadata (current term, vote, commit index, last applied), and the
/// application state machine. Every write must be durable before the method
/// returns; the consensus engine persists state through this trait before
/// any side effect it authorizes becomes externally visible.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such state exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Save the highest log index known to be committed cluster-wide.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_commit_index(&self, commit_index: u64) -> Result<()>;

    /// Get a series of log entries from storage, inclusive of both range ends.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry. Returns `None` when no entry exists at `log_index`.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Returns the id of the last entry in the log, or `(0, 0)` when the log is empty.
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs with index >= `log_index`.
    ///
    /// Used to truncate a follower's divergent tail before overwriting it
    /// with the leader's entries.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from(&self, log_index: u64) -> Result<()>;

    /// Append a payload of entries to the tail of the log.
    ///
    /// This is the leader-side write path: each entry's index is expected to
    /// extend the log without gaps or overwrites.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Write entries at the exact indexes they carry, replacing any entry
    /// already present at those indexes.
    ///
    /// This is the follower-side write path, used after a truncation to
    /// store leader-dictated entries. Writing an entry which is already
    /// present with the same term must be a no-op in effect.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn overwrite_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of committed entries to the state machine,
    /// in order, returning one response per entry.
    ///
    /// Each entry must be applied in a transaction which also records the
    /// entry's index as `last_applied`, so that apply and bookkeeping can
    /// never be observed separately. An entry whose command cannot take
    /// effect (a duplicate account, a vanished recipient) must still count
    /// as applied: the implementation reports the failure through the
    /// response value, advances `last_applied`, and leaves the application
    /// tables untouched. This is what keeps replicas identical.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;
}
