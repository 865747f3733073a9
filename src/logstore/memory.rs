//! In-memory log store.
//!
//! Nothing survives a restart.  Used by tests and by nodes configured
//! with `node.log_store: memory`.

use std::collections::VecDeque;

use super::store::{check_contiguous, HardState, LogStore, SnapshotMeta};
use crate::cluster::log::LogEntry;
use crate::cluster::membership::NodeId;
use crate::fsm::snapshot::Snapshot;

/// Log store backed by a `VecDeque`.
#[derive(Default)]
pub struct MemoryLogStore {
    hard_state: HardState,
    /// Index of `entries[0]`.
    start: u64,
    entries: VecDeque<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            start: 1,
            ..Default::default()
        }
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index < self.start {
            return None;
        }
        let pos = (index - self.start) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> anyhow::Result<HardState> {
        Ok(self.hard_state)
    }

    fn persist(&mut self, term: u64, voted_for: Option<NodeId>) -> anyhow::Result<()> {
        self.hard_state = HardState { term, voted_for };
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        check_contiguous(self.last_index(), entries)?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn get(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        Ok(self.position(index).map(|pos| self.entries[pos].clone()))
    }

    fn entries(&self, from: u64, to: u64, max: usize) -> anyhow::Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut index = from.max(self.start);
        while index <= to && out.len() < max {
            match self.position(index) {
                Some(pos) => out.push(self.entries[pos].clone()),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    fn truncate_after(&mut self, index: u64) -> anyhow::Result<()> {
        let keep = index.saturating_sub(self.start - 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn first_index(&self) -> u64 {
        self.start
    }

    fn last_index(&self) -> u64 {
        self.start + self.entries.len() as u64 - 1
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        self.snapshot
            .as_ref()
            .map(|s| SnapshotMeta {
                last_index: s.last_index,
                last_term: s.last_term,
            })
            .unwrap_or_default()
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, trailing: u64) -> anyhow::Result<()> {
        let compact_to = snapshot.last_index.saturating_sub(trailing);
        while self.start <= compact_to && !self.entries.is_empty() {
            self.entries.pop_front();
            self.start += 1;
        }
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.entries.clear();
        self.start = snapshot.last_index + 1;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}
