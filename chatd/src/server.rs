//! The node's RPC adapter: accepts peer and client connections, routes
//! writes through consensus (forwarding to the leader when needed), and
//! serves reads from the local store.

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::info;

use chatraft::error::ClientWriteError;
use chatraft::raft::ClientWriteRequest;
use chatraft::NodeId;
use chatraft::NodeStatus;
use chatraft::Raft;
use sqlstore::ChatCommand;
use sqlstore::CommandOutcome;
use sqlstore::SqlStore;

use crate::config::NodeConfig;
use crate::network;
use crate::network::ChatNetwork;
use crate::wire;
use crate::wire::Envelope;
use crate::wire::Request;
use crate::wire::Response;
use crate::wire::WireError;

/// The concrete Raft type of a chat node.
pub type ChatRaft = Raft<ChatCommand, CommandOutcome, ChatNetwork, SqlStore>;

pub struct Server {
    config: NodeConfig,
    raft: ChatRaft,
    store: Arc<SqlStore>,
}

impl Server {
    pub fn new(config: NodeConfig, raft: ChatRaft, store: Arc<SqlStore>) -> Arc<Self> {
        Arc::new(Self { config, raft, store })
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        info!(node_id = self.config.node_id, addr = %self.config.listen_address, "listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    debug!(peer = %peer_addr, error = %err, "connection ended with error");
                }
            });
        }
    }

    /// Serve one connection: a sequence of request frames, each answered in order.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            let frame = match futures::StreamExt::next(&mut framed).await {
                None => return Ok(()),
                Some(frame) => frame?,
            };
            let response = match serde_json::from_slice::<Envelope>(&frame) {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(err) => Response::Error(WireError::Invalid { reason: err.to_string() }),
            };
            wire::send(&mut framed, &response).await?;
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Response {
        match envelope.request.clone() {
            // ---- Raft peer RPCs ------------------------------------------------
            Request::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let rpc = chatraft::raft::VoteRequest::new(term, candidate_id, last_log_index, last_log_term);
                match self.raft.vote(rpc).await {
                    Ok(res) => Response::Vote {
                        term: res.term,
                        vote_granted: res.vote_granted,
                    },
                    Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
            }
            Request::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let rpc = match network::append_entries_from_wire(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    &entries,
                    leader_commit,
                ) {
                    Ok(rpc) => rpc,
                    Err(err) => return Response::Error(WireError::Invalid { reason: err.to_string() }),
                };
                match self.raft.append_entries(rpc).await {
                    Ok(res) => Response::Appended {
                        term: res.term,
                        success: res.success,
                        match_index: res.match_index,
                    },
                    Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
            }
            Request::Status => Response::Status(self.status()),

            // ---- Account operations --------------------------------------------
            Request::CreateAccount { username, password_hash } => {
                if username.is_empty() {
                    return Response::Error(WireError::Invalid {
                        reason: "username must not be empty".into(),
                    });
                }
                self.submit(&envelope, ChatCommand::CreateAccount { username, password_hash }, |outcome| {
                    if outcome.success {
                        Response::Done
                    } else {
                        Response::Error(WireError::Rejected {
                            reason: "account already exists".into(),
                        })
                    }
                })
                .await
            }
            Request::Authenticate { username, password_hash } => {
                match self.store.authenticate_user(&username, &password_hash) {
                    Ok(success) => Response::Authenticated { success },
                    Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
            }
            Request::ListAccounts { pattern } => match self.store.list_users(pattern.as_deref()) {
                Ok(usernames) => Response::Accounts { usernames },
                Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
            },
            Request::DeleteAccount { username, password_hash } => {
                // The caller must hold the account's credentials; verified
                // locally before the deletion enters the log.
                match self.store.authenticate_user(&username, &password_hash) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Response::Error(WireError::Rejected {
                            reason: "invalid username or password".into(),
                        })
                    }
                    Err(err) => return Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
                self.submit(&envelope, ChatCommand::DeleteAccount { username }, |outcome| {
                    if outcome.success {
                        Response::Done
                    } else {
                        Response::Error(WireError::Rejected {
                            reason: "no such account".into(),
                        })
                    }
                })
                .await
            }

            // ---- Message operations --------------------------------------------
            Request::SendMessage { recipient, content } => {
                let sender = match self.caller(&envelope) {
                    Ok(username) => username,
                    Err(response) => return response,
                };
                match self.store.user_exists(&recipient) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Response::Error(WireError::Rejected {
                            reason: format!("no such recipient: {}", recipient),
                        })
                    }
                    Err(err) => return Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
                // The timestamp is part of the command: it is stamped once,
                // by the leader that appends it, so every replica stores the
                // same value. A forwarded envelope is stamped again by the
                // leader, making the follower's clock irrelevant.
                let command = ChatCommand::SendMessage {
                    sender,
                    recipient,
                    content,
                    timestamp: unix_timestamp(),
                };
                self.submit(&envelope, command, |outcome| match (outcome.success, outcome.message_id) {
                    (true, Some(message_id)) => Response::Sent { message_id },
                    _ => Response::Error(WireError::Rejected {
                        reason: "recipient no longer exists".into(),
                    }),
                })
                .await
            }
            Request::GetMessages { include_read } => {
                let username = match self.caller(&envelope) {
                    Ok(username) => username,
                    Err(response) => return response,
                };
                match self.store.get_messages(&username, include_read) {
                    Ok(messages) => Response::Messages { messages },
                    Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
            }
            Request::MarkRead { message_ids } => {
                let username = match self.caller(&envelope) {
                    Ok(username) => username,
                    Err(response) => return response,
                };
                self.submit(&envelope, ChatCommand::MarkRead { username, message_ids }, |_| Response::Done).await
            }
            Request::DeleteMessages { message_ids } => {
                let username = match self.caller(&envelope) {
                    Ok(username) => username,
                    Err(response) => return response,
                };
                self.submit(&envelope, ChatCommand::DeleteMessages { username, message_ids }, |_| Response::Done)
                    .await
            }
            Request::UnreadCount => {
                let username = match self.caller(&envelope) {
                    Ok(username) => username,
                    Err(response) => return response,
                };
                match self.store.get_unread_count(&username) {
                    Ok(count) => Response::Unread { count },
                    Err(err) => Response::Error(WireError::Rejected { reason: err.to_string() }),
                }
            }
        }
    }

    /// The caller's username from the envelope metadata.
    ///
    /// The value is trusted verbatim; there are no session tokens, the
    /// authentication check is whichever `Authenticate` call the client
    /// performed earlier.
    fn caller(&self, envelope: &Envelope) -> std::result::Result<String, Response> {
        match &envelope.username {
            Some(username) if !username.is_empty() => Ok(username.clone()),
            _ => Err(Response::Error(WireError::Invalid {
                reason: "missing username metadata".into(),
            })),
        }
    }

    /// Submit a command through consensus, forwarding to the leader when
    /// this node is not it.
    async fn submit<F>(&self, envelope: &Envelope, command: ChatCommand, on_applied: F) -> Response
    where F: FnOnce(CommandOutcome) -> Response {
        match self.raft.client_write(ClientWriteRequest::new(command)).await {
            Ok(response) => on_applied(response.data),
            Err(ClientWriteError::ForwardToLeader(_, leader)) => {
                // A request that already made one hop is not relayed again;
                // stale leader hints must not bounce a write around the
                // cluster indefinitely.
                if envelope.forwarded {
                    return Response::Error(WireError::NotLeader {
                        leader_id: leader.filter(|id| *id != self.config.node_id),
                        leader_addr: None,
                    });
                }
                self.forward(envelope, leader).await
            }
            Err(ClientWriteError::CommitUncertain) => Response::Error(WireError::CommitUncertain),
            Err(ClientWriteError::RaftError(err)) => Response::Error(WireError::Rejected { reason: err.to_string() }),
        }
    }

    /// Relay the envelope, metadata included, to the leader and pass its
    /// response back verbatim. With no usable leader hint the client gets a
    /// not-leader error and retries on its own.
    async fn forward(&self, envelope: &Envelope, leader: Option<NodeId>) -> Response {
        let leader = match leader {
            Some(id) if id != self.config.node_id => id,
            _ => {
                return Response::Error(WireError::NotLeader {
                    leader_id: None,
                    leader_addr: None,
                })
            }
        };
        let addr = match self.config.peer_addr(leader) {
            Some(addr) => addr.to_string(),
            None => {
                return Response::Error(WireError::NotLeader {
                    leader_id: Some(leader),
                    leader_addr: None,
                })
            }
        };

        debug!(leader, addr = %addr, "forwarding write to leader");
        let raft_config = self.config.raft_config();
        let wait = raft_config
            .map(|c| Duration::from_millis(c.commit_wait_timeout + c.rpc_timeout))
            .unwrap_or_else(|_| Duration::from_secs(6));
        let mut forwarded = envelope.clone();
        forwarded.forwarded = true;
        let target = addr.clone();
        let res = timeout(wait, async move {
            let stream = TcpStream::connect(&target).await?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            wire::send(&mut framed, &forwarded).await?;
            wire::recv::<Response, _>(&mut framed).await
        })
        .await;

        match res {
            Ok(Ok(Some(response))) => response,
            _ => Response::Error(WireError::NotLeader {
                leader_id: Some(leader),
                leader_addr: Some(addr),
            }),
        }
    }

    /// The node's status, straight from the engine's metrics feed.
    fn status(&self) -> NodeStatus {
        let metrics = self.raft.metrics().borrow().clone();
        NodeStatus {
            id: metrics.id,
            state: metrics.state,
            current_term: metrics.current_term,
            leader_id: metrics.current_leader,
            commit_index: metrics.commit_index,
            last_applied: metrics.last_applied,
        }
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
