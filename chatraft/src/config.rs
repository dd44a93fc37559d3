//! Raft runtime configuration.

use rand::Rng;

/// Default election timeout window, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 500;
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 1000;
/// Default heartbeat interval, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default deadline for a single outbound peer RPC, in milliseconds.
const DEFAULT_RPC_TIMEOUT: u64 = 1000;
/// Default bound on how long a client write waits for commit, in milliseconds.
const DEFAULT_COMMIT_WAIT_TIMEOUT: u64 = 5000;
/// Default interval of the follower-side peer status probe, in milliseconds.
const DEFAULT_PROBE_INTERVAL: u64 = 5000;
/// Default maximum number of entries per AppendEntries payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default distance, in log entries, at which a replication stream is
/// considered to be lagging and falls back to paging entries from storage.
const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;

/// Errors raised during config validation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// The min & max election timeout values do not form a valid window.
    #[error("given values for election timeout min & max do not form a valid window")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be strictly smaller than the election timeout minimum.
    #[error("heartbeat interval must be strictly smaller than election timeout min")]
    InvalidHeartbeatInterval,
    /// The maximum AppendEntries payload size must be greater than 0.
    #[error("max payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

/// The runtime configuration of a Raft node.
///
/// The election timeout window should be noticeably wider than the heartbeat
/// interval so that healthy leaders keep their followers from timing out.
/// All durations are in milliseconds.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout.
    pub election_timeout_min: u64,
    /// The maximum election timeout.
    pub election_timeout_max: u64,
    /// The interval at which leaders send heartbeats to followers.
    pub heartbeat_interval: u64,
    /// The deadline applied to every outbound peer RPC.
    pub rpc_timeout: u64,
    /// How long a client write may wait for commit before the submission is
    /// answered with a commit-uncertain error.
    pub commit_wait_timeout: u64,
    /// The interval at which followers probe peers with the status RPC to
    /// pick up an established leader early.
    pub probe_interval: u64,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// The log distance after which a replication stream switches to paging
    /// entries out of storage instead of buffering them in memory.
    pub replication_lag_threshold: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            rpc_timeout: None,
            commit_wait_timeout: None,
            probe_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
        }
    }

    /// Generate a new random election timeout within the configured window.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max)
    }
}

/// A builder of `Config`.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    rpc_timeout: Option<u64>,
    commit_wait_timeout: Option<u64>,
    probe_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the outbound peer RPC deadline in milliseconds.
    pub fn rpc_timeout(mut self, val: u64) -> Self {
        self.rpc_timeout = Some(val);
        self
    }

    /// Set the client-write commit wait bound in milliseconds.
    pub fn commit_wait_timeout(mut self, val: u64) -> Self {
        self.commit_wait_timeout = Some(val);
        self
    }

    /// Set the peer status probe interval in milliseconds.
    pub fn probe_interval(mut self, val: u64) -> Self {
        self.probe_interval = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the replication lag threshold.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            rpc_timeout: self.rpc_timeout.unwrap_or(DEFAULT_RPC_TIMEOUT),
            commit_wait_timeout: self.commit_wait_timeout.unwrap_or(DEFAULT_COMMIT_WAIT_TIMEOUT),
            probe_interval: self.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL),
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::build("test".into()).validate().expect("default config should validate");
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn rejects_inverted_election_window() {
        let res = Config::build("test".into()).election_timeout_min(900).election_timeout_max(800).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn rejects_heartbeat_slower_than_election_min() {
        let res = Config::build("test".into())
            .election_timeout_min(200)
            .election_timeout_max(400)
            .heartbeat_interval(300)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidHeartbeatInterval);
    }

    #[test]
    fn rand_election_timeout_stays_in_window() {
        let cfg = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min && t <= cfg.election_timeout_max);
        }
    }
}
