//! Abstract log store trait.
//!
//! Any durable log backend must implement [`LogStore`].  The consensus
//! core owns its store exclusively and calls it from its event loop, so
//! the methods are synchronous and take `&mut self` for mutation.
//!
//! Index conventions: indices are 1-based.  `term_at(0)` is always `0`.
//! After a snapshot the store may still hold some entries preceding the
//! snapshot index (the trailing window); entries are only ever dropped
//! once they are covered by a snapshot.

use crate::cluster::log::LogEntry;
use crate::cluster::membership::NodeId;
use crate::fsm::snapshot::Snapshot;

/// Persistent election state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Index and term of the last entry covered by the stored snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
}

/// Durable append-only log storage contract.
pub trait LogStore: Send + 'static {
    /// Load the persisted term and vote.
    fn hard_state(&self) -> anyhow::Result<HardState>;

    /// Durably record the current term and vote before acting on them.
    fn persist(&mut self, term: u64, voted_for: Option<NodeId>) -> anyhow::Result<()>;

    /// Append entries.  The first entry must directly follow
    /// [`last_index`](LogStore::last_index).
    fn append(&mut self, entries: &[LogEntry]) -> anyhow::Result<()>;

    /// Fetch the entry at `index`, if still stored.
    fn get(&self, index: u64) -> anyhow::Result<Option<LogEntry>>;

    /// Fetch up to `max` entries in `[from, to]`.
    fn entries(&self, from: u64, to: u64, max: usize) -> anyhow::Result<Vec<LogEntry>>;

    /// Drop every entry after `index`.
    fn truncate_after(&mut self, index: u64) -> anyhow::Result<()>;

    /// Index of the first stored entry (`last_index + 1` when empty).
    fn first_index(&self) -> u64;

    /// Index of the last entry, or of the snapshot when no entry follows it.
    fn last_index(&self) -> u64;

    /// Metadata of the stored snapshot (zeroes when there is none).
    fn snapshot_meta(&self) -> SnapshotMeta;

    /// Term of the entry at `index`, if known.
    fn term_at(&self, index: u64) -> anyhow::Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(entry) = self.get(index)? {
            return Ok(Some(entry.term));
        }
        let meta = self.snapshot_meta();
        if index == meta.last_index {
            return Ok(Some(meta.last_term));
        }
        Ok(None)
    }

    /// Store a locally taken snapshot and drop entries up to
    /// `snapshot.last_index - trailing`.
    fn save_snapshot(&mut self, snapshot: &Snapshot, trailing: u64) -> anyhow::Result<()>;

    /// Replace the whole log with a snapshot received from the leader.
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// Load the stored snapshot.
    fn load_snapshot(&self) -> anyhow::Result<Option<Snapshot>>;
}

/// Check that `entries` are contiguous and directly follow `last_index`.
pub(crate) fn check_contiguous(last_index: u64, entries: &[LogEntry]) -> anyhow::Result<()> {
    let mut expected = last_index + 1;
    for entry in entries {
        anyhow::ensure!(
            entry.index == expected,
            "non-contiguous append: expected index {expected}, got {}",
            entry.index
        );
        expected += 1;
    }
    Ok(())
}
