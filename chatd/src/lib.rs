//! The raftchat node daemon.
//!
//! A node is the composition of three pieces: the `sqlstore` persistence
//! layer, the `chatraft` consensus engine, and this crate's TCP adapter,
//! which speaks a framed-JSON protocol carrying both the Raft peer RPCs and
//! the client chat operations. Client writes submitted to a follower are
//! forwarded to the leader transparently; reads are served from the local
//! store.

pub mod config;
pub mod network;
pub mod server;
pub mod wire;
