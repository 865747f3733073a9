//! Replicated state machine.
//!
//! [`state_machine::StateMachine`] applies committed entries to the
//! embedded SQL [`engine::Engine`]; [`snapshot`] produces and restores
//! deterministic dumps of it.

pub mod engine;
pub mod snapshot;
pub mod state_machine;
