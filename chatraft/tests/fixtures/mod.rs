//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use chatraft::async_trait::async_trait;
use chatraft::error::ClientWriteError;
use chatraft::metrics::RaftMetrics;
use chatraft::metrics::Wait;
use chatraft::raft::AppendEntriesRequest;
use chatraft::raft::AppendEntriesResponse;
use chatraft::raft::ClientWriteRequest;
use chatraft::raft::ClientWriteResponse;
use chatraft::raft::VoteRequest;
use chatraft::raft::VoteResponse;
use chatraft::Config;
use chatraft::NodeId;
use chatraft::NodeStatus;
use chatraft::Raft;
use chatraft::RaftNetwork;
use chatraft::State;
use sqlstore::ChatCommand;
use sqlstore::CommandOutcome;
use sqlstore::SqlStore;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type ChatRaft = Raft<ChatCommand, CommandOutcome, RaftRouter, SqlStore>;

/// Initialize the tracing system for a test.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false).with_test_writer();
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config with timers tightened for test runs.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout_min(200)
            .election_timeout_max(400)
            .heartbeat_interval(25)
            .rpc_timeout(500)
            .commit_wait_timeout(2000)
            .probe_interval(500)
            .validate()
            .expect("failed to build config"),
    )
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
///
/// Nodes on the router are reachable unless isolated; an isolated node can
/// neither send nor receive frames, which is how partitions are simulated.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (ChatRaft, Arc<SqlStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Each node's database file, kept stable across restarts.
    db_paths: Mutex<BTreeMap<NodeId, PathBuf>>,
    /// The directory holding every node's database.
    dir: TempDir,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            db_paths: Default::default(),
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        })
    }

    /// Create every node of a cluster with the given member ids.
    pub async fn new_cluster(self: &Arc<Self>, members: BTreeSet<NodeId>) -> Result<()> {
        for id in members.iter() {
            self.new_raft_node(*id, &members).await?;
        }
        Ok(())
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, members: &BTreeSet<NodeId>) -> Result<()> {
        let path = {
            let mut paths = self.db_paths.lock().await;
            paths.entry(id).or_insert_with(|| self.dir.path().join(format!("node{}.db", id))).clone()
        };
        let store = Arc::new(SqlStore::open(&path)?);
        self.new_raft_node_with_sto(id, members, store).await;
        Ok(())
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, members: &BTreeSet<NodeId>, sto: Arc<SqlStore>) {
        let peers: BTreeSet<NodeId> = members.iter().copied().filter(|m| *m != id).collect();
        let node = Raft::new(id, peers, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<(ChatRaft, Arc<SqlStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        opt_handles
    }

    /// Stop a node and bring it back with a freshly opened store on the
    /// same database file, as a process restart would.
    pub async fn restart_node(self: &Arc<Self>, id: NodeId, members: &BTreeSet<NodeId>) -> Result<()> {
        let (raft, _store) = self.remove_node(id).await.ok_or_else(|| anyhow!("node {} not running", id))?;
        raft.shutdown().await?;
        self.new_raft_node(id, members).await
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<SqlStore>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        let sto = addr.clone().1;
        Ok(sto)
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    /// Wait for specified nodes until they have appended and applied upto `want_log`(inclusive) logs.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader, if one has emerged.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.state == State::Leader && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    /// Poll until exactly one non-isolated node reports itself leader.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let metrics = self.latest_metrics().await;
            let isolated = self.isolated_nodes.read().await;
            let leaders: Vec<NodeId> = metrics
                .iter()
                .filter(|m| m.state == State::Leader && !isolated.contains(&m.id))
                .map(|m| m.id)
                .collect();
            drop(isolated);
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for single leader ({}), leaders: {:?}", msg, leaders);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a client write to the target node.
    pub async fn client_write(
        &self,
        target: NodeId,
        command: ChatCommand,
    ) -> Result<ClientWriteResponse<CommandOutcome>, ClientWriteError<ChatCommand>> {
        let node = {
            let rt = self.routing_table.read().await;
            rt.get(&target).unwrap_or_else(|| panic!("node with ID {} does not exist", target)).0.clone()
        };
        node.client_write(ClientWriteRequest::new(command)).await
    }

    async fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated_nodes.read().await.contains(&id)
    }

    async fn target_raft(&self, target: NodeId) -> Result<ChatRaft> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        Ok(node.0.clone())
    }
}

#[async_trait]
impl RaftNetwork<ChatCommand> for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<ChatCommand>) -> Result<AppendEntriesResponse> {
        if self.is_isolated(rpc.leader_id).await {
            bail!("node {} is isolated", rpc.leader_id);
        }
        if self.is_isolated(target).await {
            bail!("node {} is isolated", target);
        }
        let raft = self.target_raft(target).await?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        if self.is_isolated(rpc.candidate_id).await {
            bail!("node {} is isolated", rpc.candidate_id);
        }
        if self.is_isolated(target).await {
            bail!("node {} is isolated", target);
        }
        let raft = self.target_raft(target).await?;
        Ok(raft.vote(rpc).await?)
    }

    async fn send_status(&self, target: NodeId) -> Result<NodeStatus> {
        if self.is_isolated(target).await {
            bail!("node {} is isolated", target);
        }
        let metrics = {
            let rt = self.routing_table.read().await;
            let node = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
            node.0.metrics().borrow().clone()
        };
        Ok(NodeStatus {
            id: metrics.id,
            state: metrics.state,
            current_term: metrics.current_term,
            leader_id: metrics.current_leader,
            commit_index: metrics.commit_index,
            last_applied: metrics.last_applied,
        })
    }
}
