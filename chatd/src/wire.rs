//! The framed-JSON wire protocol.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a JSON
//! body. Requests travel inside an [`Envelope`] carrying the caller's
//! username as metadata; the username is trusted verbatim, authentication
//! being whichever prior `Authenticate` call the client performed.

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use chatraft::raft::Entry;
use chatraft::LogId;
use chatraft::NodeStatus;
use sqlstore::ChatCommand;
use sqlstore::CommandDecodeError;
use sqlstore::Message;

/// A request plus its caller metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// The calling username, for authenticated chat operations.
    pub username: Option<String>,
    /// Set when a node relays a client write to the leader. A forwarded
    /// write is never forwarded again; a node that cannot serve it answers
    /// not-leader and leaves the retry to the original client.
    #[serde(default)]
    pub forwarded: bool,
    pub request: Request,
}

/// A log entry as it travels between peers: a fixed integer command tag and
/// a JSON payload string, exactly as stored in the log table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEntry {
    pub index: u64,
    pub term: u64,
    pub command_type: i64,
    pub command_data: String,
}

impl WireEntry {
    pub fn encode(entry: &Entry<ChatCommand>) -> serde_json::Result<Self> {
        Ok(Self {
            index: entry.log_id.index,
            term: entry.log_id.term,
            command_type: entry.command.type_tag(),
            command_data: entry.command.payload_json()?,
        })
    }

    pub fn decode(&self) -> Result<Entry<ChatCommand>, CommandDecodeError> {
        Ok(Entry {
            log_id: LogId::new(self.term, self.index),
            command: ChatCommand::from_parts(self.command_type, &self.command_data)?,
        })
    }
}

/// Every operation a node answers, peer and client alike.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    // Raft peer RPCs.
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<WireEntry>,
        leader_commit: u64,
    },
    Status,

    // Client account operations.
    CreateAccount { username: String, password_hash: String },
    Authenticate { username: String, password_hash: String },
    ListAccounts { pattern: Option<String> },
    DeleteAccount { username: String, password_hash: String },

    // Client message operations.
    SendMessage { recipient: String, content: String },
    GetMessages { include_read: bool },
    MarkRead { message_ids: Vec<i64> },
    DeleteMessages { message_ids: Vec<i64> },
    UnreadCount,
}

/// The answer to a [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Vote { term: u64, vote_granted: bool },
    Appended { term: u64, success: bool, match_index: u64 },
    Status(NodeStatus),

    /// A write went through consensus and took effect.
    Done,
    Authenticated { success: bool },
    Accounts { usernames: Vec<String> },
    Messages { messages: Vec<Message> },
    Sent { message_id: i64 },
    Unread { count: u64 },

    Error(WireError),
}

/// Typed failures a client must be able to act on.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
pub enum WireError {
    /// The write reached a non-leader and could not be forwarded; retry
    /// against the indicated peer, or any peer when the hint is empty.
    #[error("not the leader; current leader is {leader_id:?}")]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },
    /// The write may or may not have taken effect; retry idempotently.
    #[error("commit state of the request is unknown")]
    CommitUncertain,
    /// An application-level rejection (duplicate account, bad credentials, ...).
    #[error("{reason}")]
    Rejected { reason: String },
    /// The request was malformed; nothing was mutated.
    #[error("invalid request: {reason}")]
    Invalid { reason: String },
}

/// Send one frame.
pub async fn send<T, S>(framed: &mut Framed<S, LengthDelimitedCodec>, msg: &T) -> anyhow::Result<()>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)?;
    framed.send(Bytes::from(body)).await?;
    Ok(())
}

/// Receive one frame, or `None` on a cleanly closed connection.
pub async fn recv<T, S>(framed: &mut Framed<S, LengthDelimitedCodec>) -> anyhow::Result<Option<T>>
where
    T: DeserializeOwned,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => {
            let frame = frame?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_entry_round_trips_a_command() {
        let entry = Entry {
            log_id: LogId::new(3, 7),
            command: ChatCommand::SendMessage {
                sender: "alice".into(),
                recipient: "bob".into(),
                content: "hello".into(),
                timestamp: 1_700_000_000,
            },
        };
        let wire = WireEntry::encode(&entry).unwrap();
        assert_eq!(wire.command_type, 3);
        assert_eq!(wire.index, 7);
        let back = wire.decode().unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn malformed_wire_entry_is_rejected() {
        let wire = WireEntry {
            index: 1,
            term: 1,
            command_type: 1,
            command_data: "not json".into(),
        };
        assert!(wire.decode().is_err());
    }
}
