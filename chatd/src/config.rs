//! Node configuration.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;

use chatraft::NodeId;

/// The startup options of a single node, loaded from a TOML file.
///
/// ```toml
/// node_id = 1
/// listen_address = "127.0.0.1:7101"
/// storage_path = "data/node1.db"
///
/// [[peers]]
/// id = 2
/// addr = "127.0.0.1:7102"
///
/// [[peers]]
/// id = 3
/// addr = "127.0.0.1:7103"
/// ```
///
/// The peer set is the initial and only membership: it is static for the
/// life of the process.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Cluster-unique numeric id of this node.
    pub node_id: NodeId,
    /// host:port to listen on for both peers and clients.
    pub listen_address: String,
    /// Filesystem path of the durable store.
    pub storage_path: PathBuf,
    /// Every other member of the cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Optional overrides of the Raft timing parameters.
    #[serde(default)]
    pub raft: RaftTuning,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: String,
}

/// Optional Raft tuning knobs; anything unset uses the engine defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RaftTuning {
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub rpc_timeout: Option<u64>,
    pub commit_wait_timeout: Option<u64>,
    pub probe_interval: Option<u64>,
}

impl NodeConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the internal consistency of this config.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.id == self.node_id {
                bail!("peer table must not contain this node's own id {}", self.node_id);
            }
            if !seen.insert(peer.id) {
                bail!("duplicate peer id {} in config", peer.id);
            }
        }
        Ok(())
    }

    /// The ids of all peers.
    pub fn peer_ids(&self) -> BTreeSet<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// Peer id → address.
    pub fn peer_addrs(&self) -> BTreeMap<NodeId, String> {
        self.peers.iter().map(|p| (p.id, p.addr.clone())).collect()
    }

    /// The address of a single peer.
    pub fn peer_addr(&self, id: NodeId) -> Option<&str> {
        self.peers.iter().find(|p| p.id == id).map(|p| p.addr.as_str())
    }

    /// Build the engine config from the defaults plus any overrides.
    pub fn raft_config(&self) -> Result<chatraft::Config, chatraft::ConfigError> {
        let mut builder = chatraft::Config::build("raftchat".into());
        if let Some(v) = self.raft.election_timeout_min {
            builder = builder.election_timeout_min(v);
        }
        if let Some(v) = self.raft.election_timeout_max {
            builder = builder.election_timeout_max(v);
        }
        if let Some(v) = self.raft.heartbeat_interval {
            builder = builder.heartbeat_interval(v);
        }
        if let Some(v) = self.raft.rpc_timeout {
            builder = builder.rpc_timeout(v);
        }
        if let Some(v) = self.raft.commit_wait_timeout {
            builder = builder.commit_wait_timeout(v);
        }
        if let Some(v) = self.raft.probe_interval {
            builder = builder.probe_interval(v);
        }
        builder.validate()
    }
}
