//! SQLite-backed log store.
//!
//! Entries, the election state and the latest snapshot live in a single
//! database file under the node's data directory.  Entry payloads and
//! snapshots are stored as JSON text.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{check_contiguous, HardState, LogStore, SnapshotMeta};
use crate::cluster::log::{LogEntry, Payload};
use crate::cluster::membership::NodeId;
use crate::fsm::snapshot::Snapshot;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Log store backed by a single SQLite database file.
pub struct SqliteLogStore {
    conn: Connection,
    /// Cached bounds, refreshed after every mutation.
    first: u64,
    last: u64,
    meta: SnapshotMeta,
}

impl SqliteLogStore {
    /// Open (or create) the log database at `path`.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self {
            conn,
            first: 1,
            last: 0,
            meta: SnapshotMeta::default(),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        store.meta = store.read_meta()?;
        store.refresh_bounds()?;
        Ok(store)
    }

    /// Every acknowledged append must survive a crash, hence FULL sync.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the tables if they do not already exist.  Idempotent.
    fn init_db(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                idx     INTEGER PRIMARY KEY,
                term    INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hard_state (
                id        INTEGER PRIMARY KEY CHECK (id = 1),
                term      INTEGER NOT NULL,
                voted_for INTEGER
            );

            CREATE TABLE IF NOT EXISTS snapshot (
                id         INTEGER PRIMARY KEY CHECK (id = 1),
                last_index INTEGER NOT NULL,
                last_term  INTEGER NOT NULL,
                data       TEXT NOT NULL
            );
            ",
        )?;

        let existing: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            self.conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![
                    SCHEMA_VERSION,
                    httpdate::fmt_http_date(std::time::SystemTime::now())
                ],
            )?;
        }
        Ok(())
    }

    fn read_meta(&self) -> anyhow::Result<SnapshotMeta> {
        let meta = self
            .conn
            .query_row(
                "SELECT last_index, last_term FROM snapshot WHERE id = 1",
                [],
                |row| {
                    Ok(SnapshotMeta {
                        last_index: row.get::<_, i64>(0)? as u64,
                        last_term: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(meta.unwrap_or_default())
    }

    fn refresh_bounds(&mut self) -> anyhow::Result<()> {
        let (min, max): (Option<i64>, Option<i64>) =
            self.conn
                .query_row("SELECT MIN(idx), MAX(idx) FROM entries", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
        match (min, max) {
            (Some(min), Some(max)) => {
                self.first = min as u64;
                self.last = max as u64;
            }
            _ => {
                self.last = self.meta.last_index;
                self.first = self.last + 1;
            }
        }
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let data = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshot (id, last_index, last_term, data)
             VALUES (1, ?1, ?2, ?3)",
            params![snapshot.last_index as i64, snapshot.last_term as i64, data],
        )?;
        Ok(())
    }
}

fn decode_entry(index: i64, term: i64, payload: &str) -> anyhow::Result<LogEntry> {
    let payload: Payload = serde_json::from_str(payload)?;
    Ok(LogEntry::new(index as u64, term as u64, payload))
}

impl LogStore for SqliteLogStore {
    fn hard_state(&self) -> anyhow::Result<HardState> {
        let state = self
            .conn
            .query_row(
                "SELECT term, voted_for FROM hard_state WHERE id = 1",
                [],
                |row| {
                    Ok(HardState {
                        term: row.get::<_, i64>(0)? as u64,
                        voted_for: row.get::<_, Option<i64>>(1)?.map(|v| v as NodeId),
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    fn persist(&mut self, term: u64, voted_for: Option<NodeId>) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO hard_state (id, term, voted_for) VALUES (1, ?1, ?2)",
            params![term as i64, voted_for.map(|v| v as i64)],
        )?;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.last, entries)?;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO entries (idx, term, payload) VALUES (?1, ?2, ?3)")?;
            for entry in entries {
                let payload = serde_json::to_string(&entry.payload)?;
                stmt.execute(params![entry.index as i64, entry.term as i64, payload])?;
            }
        }
        tx.commit()?;
        self.refresh_bounds()
    }

    fn get(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        let row: Option<(i64, i64, String)> = self
            .conn
            .query_row(
                "SELECT idx, term, payload FROM entries WHERE idx = ?1",
                params![index as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(idx, term, payload)| decode_entry(idx, term, &payload))
            .transpose()
    }

    fn entries(&self, from: u64, to: u64, max: usize) -> anyhow::Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT idx, term, payload FROM entries
             WHERE idx >= ?1 AND idx <= ?2 ORDER BY idx LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![from as i64, to as i64, max as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|(idx, term, payload)| decode_entry(*idx, *term, payload))
            .collect()
    }

    fn truncate_after(&mut self, index: u64) -> anyhow::Result<()> {
        self.conn
            .execute("DELETE FROM entries WHERE idx > ?1", params![index as i64])?;
        self.refresh_bounds()
    }

    fn first_index(&self) -> u64 {
        self.first
    }

    fn last_index(&self) -> u64 {
        self.last
    }

    fn snapshot_meta(&self) -> SnapshotMeta {
        self.meta
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, trailing: u64) -> anyhow::Result<()> {
        let compact_to = snapshot.last_index.saturating_sub(trailing);
        let tx = self.conn.unchecked_transaction()?;
        self.write_snapshot(snapshot)?;
        tx.execute(
            "DELETE FROM entries WHERE idx <= ?1",
            params![compact_to as i64],
        )?;
        tx.commit()?;
        self.meta = SnapshotMeta {
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
        };
        self.refresh_bounds()
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.write_snapshot(snapshot)?;
        tx.execute("DELETE FROM entries", [])?;
        tx.commit()?;
        self.meta = SnapshotMeta {
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
        };
        self.refresh_bounds()
    }

    fn load_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM snapshot WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(anyhow::Error::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstore::store::conformance;

    fn test_store() -> SqliteLogStore {
        SqliteLogStore::open(":memory:").unwrap()
    }

    #[test]
    fn test_schema_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.db");
        drop(SqliteLogStore::open(&path).unwrap());
        let store = SqliteLogStore::open(&path).unwrap();
        let version: i64 = store
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_empty_store() {
        conformance::empty_store(&test_store());
    }

    #[test]
    fn test_append_get_truncate() {
        conformance::append_get_truncate(&mut test_store());
    }

    #[test]
    fn test_hard_state_roundtrip() {
        conformance::hard_state_roundtrip(&mut test_store());
    }

    #[test]
    fn test_snapshot_compaction() {
        conformance::snapshot_compaction(&mut test_store());
    }

    #[test]
    fn test_snapshot_install() {
        conformance::snapshot_install(&mut test_store());
    }

    #[test]
    fn test_payload_roundtrip() {
        conformance::payload_roundtrip(&mut test_store());
    }

    #[test]
    fn test_reopen_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.db");
        {
            let mut store = SqliteLogStore::open(&path).unwrap();
            store.persist(3, Some(2)).unwrap();
            let entries: Vec<LogEntry> = (1..=6).map(|i| conformance::entry(i, 2)).collect();
            store.append(&entries).unwrap();
            store
                .save_snapshot(&conformance::snapshot(5, 2), 1)
                .unwrap();
        }

        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(
            store.hard_state().unwrap(),
            HardState {
                term: 3,
                voted_for: Some(2)
            }
        );
        assert_eq!(store.first_index(), 5);
        assert_eq!(store.last_index(), 6);
        assert_eq!(store.snapshot_meta().last_index, 5);
        let snapshot = store.load_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.last_term, 2);
        assert!(snapshot.configuration.is_voter(1));
    }

    #[test]
    fn test_reopen_after_install_with_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.db");
        {
            let mut store = SqliteLogStore::open(&path).unwrap();
            store
                .install_snapshot(&conformance::snapshot(12, 4))
                .unwrap();
        }
        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(store.first_index(), 13);
        assert_eq!(store.last_index(), 12);
        assert_eq!(store.term_at(12).unwrap(), Some(4));
    }
}
