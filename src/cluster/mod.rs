//! Consensus and cluster membership.
//!
//! Every node runs a [`node::RaftNode`]: a tokio task owning a sans-I/O
//! [`raft::RaftCore`] that replicates [`log::LogEntry`] values to peers
//! through a [`transport::Transport`].  Membership is itself replicated
//! state carried by membership entries.

pub mod log;
pub mod membership;
pub mod messages;
pub mod node;
pub mod raft;
pub mod transport;
