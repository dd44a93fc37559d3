//! The chat state machine's command and response types.
//!
//! Commands are the application data carried by the replicated log. On the
//! wire and on disk every command is a fixed integer tag plus a JSON payload
//! string; there is exactly one representation, so a command read back from
//! any replica's log is byte-for-byte what the leader wrote.

use serde::Deserialize;
use serde::Serialize;

/// A deterministic command against the chat state machine.
///
/// Any value a handler needs that would otherwise come from the local node
/// (the message timestamp, notably) is embedded in the command by the leader
/// at creation time, so every replica applies exactly the same mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatCommand {
    /// Create a user account. Fails (without effect) if the name is taken.
    CreateAccount { username: String, password_hash: String },
    /// Delete a user account along with every message the user sent or received.
    DeleteAccount { username: String },
    /// Deliver a message to `recipient`'s inbox.
    ///
    /// `timestamp` is seconds since the epoch, stamped by the leader.
    SendMessage {
        sender: String,
        recipient: String,
        content: String,
        timestamp: i64,
    },
    /// Mark the given messages in `username`'s inbox as read.
    MarkRead { username: String, message_ids: Vec<i64> },
    /// Delete the given messages from `username`'s inbox.
    DeleteMessages { username: String, message_ids: Vec<i64> },
}

/// An error decoding a command from its stored or wire representation.
#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("unknown command type tag: {0}")]
    UnknownTag(i64),
    #[error("malformed command payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct CreateAccountPayload {
    username: String,
    password_hash: String,
}

#[derive(Serialize, Deserialize)]
struct DeleteAccountPayload {
    username: String,
}

#[derive(Serialize, Deserialize)]
struct SendMessagePayload {
    sender: String,
    recipient: String,
    content: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct MessageIdsPayload {
    username: String,
    message_ids: Vec<i64>,
}

impl ChatCommand {
    /// The fixed integer tag identifying this command's type on disk and on the wire.
    pub fn type_tag(&self) -> i64 {
        match self {
            ChatCommand::CreateAccount { .. } => 1,
            ChatCommand::DeleteAccount { .. } => 2,
            ChatCommand::SendMessage { .. } => 3,
            ChatCommand::MarkRead { .. } => 4,
            ChatCommand::DeleteMessages { .. } => 5,
        }
    }

    /// Serialize this command's payload as JSON.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            ChatCommand::CreateAccount { username, password_hash } => serde_json::to_string(&CreateAccountPayload {
                username: username.clone(),
                password_hash: password_hash.clone(),
            }),
            ChatCommand::DeleteAccount { username } => serde_json::to_string(&DeleteAccountPayload {
                username: username.clone(),
            }),
            ChatCommand::SendMessage {
                sender,
                recipient,
                content,
                timestamp,
            } => serde_json::to_string(&SendMessagePayload {
                sender: sender.clone(),
                recipient: recipient.clone(),
                content: content.clone(),
                timestamp: *timestamp,
            }),
            ChatCommand::MarkRead { username, message_ids } => serde_json::to_string(&MessageIdsPayload {
                username: username.clone(),
                message_ids: message_ids.clone(),
            }),
            ChatCommand::DeleteMessages { username, message_ids } => serde_json::to_string(&MessageIdsPayload {
                username: username.clone(),
                message_ids: message_ids.clone(),
            }),
        }
    }

    /// Decode a command from its `(type_tag, payload)` representation.
    pub fn from_parts(type_tag: i64, payload: &str) -> Result<Self, CommandDecodeError> {
        match type_tag {
            1 => {
                let p: CreateAccountPayload = serde_json::from_str(payload)?;
                Ok(ChatCommand::CreateAccount {
                    username: p.username,
                    password_hash: p.password_hash,
                })
            }
            2 => {
                let p: DeleteAccountPayload = serde_json::from_str(payload)?;
                Ok(ChatCommand::DeleteAccount { username: p.username })
            }
            3 => {
                let p: SendMessagePayload = serde_json::from_str(payload)?;
                Ok(ChatCommand::SendMessage {
                    sender: p.sender,
                    recipient: p.recipient,
                    content: p.content,
                    timestamp: p.timestamp,
                })
            }
            4 => {
                let p: MessageIdsPayload = serde_json::from_str(payload)?;
                Ok(ChatCommand::MarkRead {
                    username: p.username,
                    message_ids: p.message_ids,
                })
            }
            5 => {
                let p: MessageIdsPayload = serde_json::from_str(payload)?;
                Ok(ChatCommand::DeleteMessages {
                    username: p.username,
                    message_ids: p.message_ids,
                })
            }
            other => Err(CommandDecodeError::UnknownTag(other)),
        }
    }
}

/// The result of applying a single command to the state machine.
///
/// `success == false` means the command could not take effect (duplicate
/// account, vanished recipient) but the entry still counts as applied;
/// the failure is reported to the submitting client as an application-level
/// rejection, never as a Raft error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    /// The id assigned to the delivered message, for `SendMessage` only.
    pub message_id: Option<i64>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message_id: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            message_id: None,
        }
    }

    pub fn delivered(message_id: i64) -> Self {
        Self {
            success: true,
            message_id: Some(message_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        let cmds = vec![
            ChatCommand::CreateAccount {
                username: "alice".into(),
                password_hash: "h".into(),
            },
            ChatCommand::DeleteAccount { username: "alice".into() },
            ChatCommand::SendMessage {
                sender: "alice".into(),
                recipient: "bob".into(),
                content: "hi".into(),
                timestamp: 1_700_000_000,
            },
            ChatCommand::MarkRead {
                username: "bob".into(),
                message_ids: vec![1, 2],
            },
            ChatCommand::DeleteMessages {
                username: "bob".into(),
                message_ids: vec![3],
            },
        ];
        let tags: Vec<i64> = cmds.iter().map(|c| c.type_tag()).collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);

        for cmd in cmds {
            let payload = cmd.payload_json().unwrap();
            let back = ChatCommand::from_parts(cmd.type_tag(), &payload).unwrap();
            assert_eq!(back, cmd);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let res = ChatCommand::from_parts(42, "{}");
        assert!(matches!(res, Err(CommandDecodeError::UnknownTag(42))));
    }
}
