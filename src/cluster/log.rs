//! Replicated log entry types.

use serde::{Deserialize, Serialize};

use super::membership::{Configuration, MembershipChange};
use crate::fsm::engine::SqlCommand;

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// No-op appended by a new leader to commit entries of earlier terms.
    Barrier,
    /// SQL writes applied atomically by the state machine.
    Command(SqlCommand),
    /// A membership change and the complete node table that results.
    Membership {
        change: MembershipChange,
        configuration: Configuration,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Barrier => "barrier",
            Payload::Command(_) => "command",
            Payload::Membership { .. } => "membership",
        }
    }

    /// The configuration carried by a membership entry.
    pub fn configuration(&self) -> Option<&Configuration> {
        match self {
            Payload::Membership { configuration, .. } => Some(configuration),
            _ => None,
        }
    }
}

/// A single entry in the replicated log.  Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (1-based).
    pub index: u64,
    /// Term of the leader that created the entry.
    pub term: u64,
    pub payload: Payload,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: Payload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}
