//! Durable storage for the replicated log.
//!
//! The [`store::LogStore`] trait defines the interface;
//! [`sqlite::SqliteLogStore`] is the default implementation and
//! [`memory::MemoryLogStore`] keeps everything in process memory.

pub mod memory;
pub mod sqlite;
pub mod store;
