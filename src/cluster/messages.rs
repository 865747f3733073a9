//! Peer-to-peer consensus messages.
//!
//! Messages are one-way: a response is just another message travelling
//! in the opposite direction.  Every message carries the sender's id,
//! its reachable address and its current term.

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::membership::NodeId;
use crate::fsm::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub from_address: String,
    pub term: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    RequestVote {
        last_log_index: u64,
        last_log_term: u64,
        /// Set by a leadership-transfer election so voters ignore their
        /// current leader.
        disrupt_leader: bool,
    },
    RequestVoteResponse {
        granted: bool,
    },
    AppendEntries {
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        success: bool,
        /// On success the follower's match index, otherwise the index
        /// the leader should retry after.
        last_index: u64,
    },
    InstallSnapshot {
        snapshot: Box<Snapshot>,
    },
    InstallSnapshotResponse {
        last_index: u64,
    },
    /// Start an election immediately.
    TimeoutNow,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RequestVote { .. } => "request_vote",
            MessageBody::RequestVoteResponse { .. } => "request_vote_response",
            MessageBody::AppendEntries { .. } => "append_entries",
            MessageBody::AppendEntriesResponse { .. } => "append_entries_response",
            MessageBody::InstallSnapshot { .. } => "install_snapshot",
            MessageBody::InstallSnapshotResponse { .. } => "install_snapshot_response",
            MessageBody::TimeoutNow => "timeout_now",
        }
    }
}

/// A message addressed to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: NodeId,
    pub address: String,
    pub message: Message,
}
