//! The replicated state machine.
//!
//! Committed log entries are applied here, one at a time and in index
//! order, by the consensus event loop.  Sessions read through
//! [`StateMachine::with_engine`], which refuses access while a snapshot
//! is being installed.
//!
//! Progress is published through a `watch` channel so callers can wait
//! for a given index to be applied without polling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::engine::{Engine, ExecResult};
use super::snapshot::{self, DatabaseDump, Snapshot, SNAPSHOT_VERSION};
use crate::cluster::log::{LogEntry, Payload};
use crate::cluster::membership::Configuration;
use crate::errors::DbError;

/// Index and term of the last applied entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Applied {
    index: u64,
    term: u64,
}

pub struct StateMachine {
    engine: Mutex<Engine>,
    configuration: RwLock<Configuration>,
    applied: Mutex<Applied>,
    applied_tx: watch::Sender<u64>,
    restoring: AtomicBool,
}

impl StateMachine {
    /// Create an empty state machine serving the given logical databases.
    pub fn new<S: AsRef<str>>(databases: &[S]) -> Result<Self, DbError> {
        let (applied_tx, _) = watch::channel(0);
        Ok(Self {
            engine: Mutex::new(Engine::open(databases)?),
            configuration: RwLock::new(Configuration::new()),
            applied: Mutex::new(Applied::default()),
            applied_tx,
            restoring: AtomicBool::new(false),
        })
    }

    /// Apply one committed entry.
    ///
    /// A command that fails inside the engine is rolled back and its error
    /// returned; the entry still counts as applied, identically on every
    /// replica.
    pub fn apply(&self, entry: &LogEntry) -> Result<ExecResult, DbError> {
        let result = match &entry.payload {
            Payload::Barrier => Ok(ExecResult::default()),
            Payload::Command(command) => {
                let engine = self.engine.lock().expect("mutex poisoned");
                engine.apply(command)
            }
            Payload::Membership {
                change,
                configuration,
            } => {
                info!(index = entry.index, %change, "applying membership change");
                *self.configuration.write().expect("lock poisoned") = configuration.clone();
                Ok(ExecResult::default())
            }
        };
        if let Err(err) = &result {
            debug!(index = entry.index, error = %err, "command failed on apply");
        }
        self.set_applied(entry.index, entry.term);
        result
    }

    fn set_applied(&self, index: u64, term: u64) {
        *self.applied.lock().expect("mutex poisoned") = Applied { index, term };
        self.applied_tx.send_replace(index);
    }

    /// Index of the last applied entry.
    pub fn last_applied(&self) -> u64 {
        self.applied.lock().expect("mutex poisoned").index
    }

    /// Take a snapshot of everything applied so far.
    pub fn snapshot(&self) -> Result<Snapshot, DbError> {
        let engine = self.engine.lock().expect("mutex poisoned");
        let applied = *self.applied.lock().expect("mutex poisoned");
        let mut databases = BTreeMap::new();
        for (name, conn) in engine.connections() {
            databases.insert(name.to_string(), snapshot::dump_database(conn)?);
        }
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            last_index: applied.index,
            last_term: applied.term,
            configuration: self.nodes(),
            databases,
        })
    }

    /// Replace all state with the content of `snapshot`.
    ///
    /// Client access fails with `NotReady` until the swap is complete.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DbError::Protocol {
                message: format!("unsupported snapshot version {}", snapshot.version),
            });
        }
        self.restoring.store(true, Ordering::SeqCst);
        let result = self.restore_inner(snapshot);
        self.restoring.store(false, Ordering::SeqCst);
        result?;
        info!(
            last_index = snapshot.last_index,
            last_term = snapshot.last_term,
            "restored snapshot"
        );
        Ok(())
    }

    fn restore_inner(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        let mut engine = self.engine.lock().expect("mutex poisoned");
        let mut databases = BTreeMap::new();
        for name in engine.names() {
            let conn = match snapshot.databases.get(name) {
                Some(dump) => snapshot::restore_database(dump)?,
                None => super::engine::open_connection()?,
            };
            databases.insert(name.to_string(), conn);
        }
        engine.replace_all(databases);
        *self.configuration.write().expect("lock poisoned") = snapshot.configuration.clone();
        drop(engine);
        self.set_applied(snapshot.last_index, snapshot.last_term);
        Ok(())
    }

    /// Run `f` against the engine unless a snapshot is being installed.
    pub fn with_engine<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Engine) -> Result<T, DbError>,
    {
        if self.restoring.load(Ordering::SeqCst) {
            return Err(DbError::NotReady);
        }
        let engine = self.engine.lock().expect("mutex poisoned");
        f(&engine)
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    /// The node table as of the last applied entry.
    pub fn nodes(&self) -> Configuration {
        self.configuration.read().expect("lock poisoned").clone()
    }

    /// Deterministic logical dump of one database.
    pub fn dump(&self, database: &str) -> Result<DatabaseDump, DbError> {
        self.with_engine(|engine| {
            let conn = engine
                .connections()
                .find(|(name, _)| *name == database)
                .map(|(_, conn)| conn)
                .ok_or_else(|| DbError::NotFound {
                    name: database.to_string(),
                })?;
            snapshot::dump_database(conn)
        })
    }

    /// Checksum over every database; equal on replicas with equal state.
    pub fn checksum(&self) -> Result<String, DbError> {
        let databases = self.with_engine(|engine| {
            let mut out = BTreeMap::new();
            for (name, conn) in engine.connections() {
                out.insert(name.to_string(), snapshot::dump_database(conn)?);
            }
            Ok(out)
        })?;
        snapshot::checksum(&databases)
    }

    /// Subscribe to the applied index.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    /// Wait until the entry at `index` has been applied.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<(), DbError> {
        let mut rx = self.subscribe();
        let wait = async move {
            rx.wait_for(|applied| *applied >= index).await?;
            Ok::<_, watch::error::RecvError>(())
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DbError::Shutdown),
            Err(_) => Err(DbError::Timeout),
        }
    }
}
