//! HTTP handlers.  Routing lives in [`crate::server`].

pub mod cluster;
pub mod raft;
pub mod session;
