//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious
//! uses are: the node status RPC, health checks, and the `Wait` helper
//! used throughout the integration tests to await cluster conditions.

use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;

use crate::core::State;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The highest log index known to be committed cluster-wide.
    pub commit_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
        }
    }
}

/// Error variants of a `Wait`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A helper that awaits a metrics condition with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func, msg), fields(msg = msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait is satisfied: {}", msg);
                return Ok(latest);
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            };
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the log to be appended and applied up to `want_log` (inclusive).
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied >= want_log,
            &format!("{} .. log at least {}", msg, want_log),
        )
        .await
    }

    /// Wait for `state`.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.state == want_state,
            &format!("{} .. state is {:?}", msg, want_state),
        )
        .await
    }

    /// Wait for `current_leader` to become the given node id.
    pub async fn current_leader(&self, leader_id: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader_id),
            &format!("{} .. current_leader is {}", msg, leader_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_once_condition_holds() {
        let (tx, rx) = watch::channel(RaftMetrics::new_initial(1));
        let wait = Wait {
            timeout: Duration::from_millis(500),
            rx,
        };
        let handle = tokio::spawn(async move { wait.metrics(|m| m.current_term == 2, "term 2").await });
        let mut updated = RaftMetrics::new_initial(1);
        updated.current_term = 2;
        tx.send(updated).unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.current_term, 2);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (_tx, rx) = watch::channel(RaftMetrics::new_initial(1));
        let wait = Wait {
            timeout: Duration::from_millis(50),
            rx,
        };
        let res = wait.metrics(|m| m.current_term == 99, "term 99").await;
        assert!(matches!(res, Err(WaitError::Timeout(_, _))));
    }
}
