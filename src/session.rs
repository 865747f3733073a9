//! Client sessions.
//!
//! A session is created by `HANDSHAKE` and owns the client's open
//! database, its prepared statements, its row cursors and an optional
//! pending transaction.  Sessions are looked up by opaque id; each one
//! sits behind its own async mutex, so a write waiting for commit
//! suspends only that session.
//!
//! Writes always go through [`RaftNode::propose`].  Inside an explicit
//! transaction (`BEGIN` .. `COMMIT`) writes are buffered in the session:
//! each `EXEC` reports the result of a rolled-back preview, and `COMMIT`
//! proposes the whole buffer as one command.  The buffer is local to this
//! node and to the term it was opened in; it never follows leadership.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::membership::{Configuration, NodeId, NodeInfo, Role};
use crate::cluster::node::RaftNode;
use crate::config::{DatabaseConfig, ReadConsistency};
use crate::errors::DbError;
use crate::fsm::engine::{
    check_deterministic_params, ExecResult, SqlCommand, SqlStatement, StatementInfo, StatementKind,
    Value,
};
use crate::metrics::SESSIONS_ACTIVE;

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub session_id: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub stmt_id: u32,
    pub param_count: usize,
    pub readonly: bool,
}

/// First batch of a query.  `rows_id` is set while rows remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rows_id: Option<u32>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsBatch {
    pub rows: Vec<Vec<Value>>,
    pub done: bool,
}

struct Prepared {
    sql: String,
    info: StatementInfo,
}

/// Writes buffered between `BEGIN` and `COMMIT`.
struct PendingTransaction {
    term: u64,
    statements: Vec<SqlStatement>,
}

struct Session {
    database: Option<String>,
    statements: HashMap<u32, Prepared>,
    cursors: HashMap<u32, VecDeque<Vec<Value>>>,
    next_stmt_id: u32,
    next_rows_id: u32,
    transaction: Option<PendingTransaction>,
    last_used: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            database: None,
            statements: HashMap::new(),
            cursors: HashMap::new(),
            next_stmt_id: 1,
            next_rows_id: 1,
            transaction: None,
            last_used: Instant::now(),
        }
    }

    fn database(&self) -> Result<String, DbError> {
        self.database.clone().ok_or_else(|| DbError::Protocol {
            message: "no database is open on this session".to_string(),
        })
    }

    fn statement(&self, id: u32) -> Result<&Prepared, DbError> {
        self.statements
            .get(&id)
            .ok_or(DbError::NoSuchStatement { id })
    }

    fn preamble(&self) -> &[SqlStatement] {
        self.transaction
            .as_ref()
            .map(|t| t.statements.as_slice())
            .unwrap_or(&[])
    }
}

type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    raft: RaftNode,
    consistency: ReadConsistency,
    idle_timeout: Duration,
    batch_size: usize,
    max_result_rows: usize,
}

impl SessionManager {
    pub fn new(raft: RaftNode, config: &DatabaseConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            raft,
            consistency: config.read_consistency,
            idle_timeout: Duration::from_secs(config.session_idle_timeout),
            batch_size: config.rows_batch_size.max(1),
            max_result_rows: config.max_result_rows.max(1),
        }
    }

    pub fn raft(&self) -> &RaftNode {
        &self.raft
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Lifecycle ------------------------------------------------------------

    pub fn handshake(&self, version: u32) -> Result<HandshakeResponse, DbError> {
        if version != PROTOCOL_VERSION {
            return Err(DbError::Protocol {
                message: format!(
                    "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
                ),
            });
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().expect("mutex poisoned");
        sessions.insert(
            session_id.clone(),
            Arc::new(tokio::sync::Mutex::new(Session::new())),
        );
        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        debug!(session = %session_id, "session opened");
        Ok(HandshakeResponse {
            session_id,
            version: PROTOCOL_VERSION,
        })
    }

    /// Drop a session with everything it holds, including a pending
    /// transaction.
    pub fn disconnect(&self, sid: &str) -> Result<(), DbError> {
        let mut sessions = self.sessions.lock().expect("mutex poisoned");
        let removed = sessions.remove(sid);
        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        removed.map(|_| ()).ok_or(DbError::NoSuchSession)
    }

    /// Remove sessions idle for longer than the configured timeout.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().expect("mutex poisoned");
        let before = sessions.len();
        sessions.retain(|_, session| match session.try_lock() {
            Ok(s) => now.duration_since(s.last_used) < self.idle_timeout,
            // Busy sessions are not idle.
            Err(_) => true,
        });
        let reaped = before - sessions.len();
        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        if reaped > 0 {
            info!(reaped, "closed idle sessions");
        }
        reaped
    }

    /// Reap idle sessions periodically until the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = (self.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.reap_idle();
                    }
                    None => break,
                }
            }
        })
    }

    fn session(&self, sid: &str) -> Result<SessionHandle, DbError> {
        self.sessions
            .lock()
            .expect("mutex poisoned")
            .get(sid)
            .cloned()
            .ok_or(DbError::NoSuchSession)
    }

    async fn lock(&self, sid: &str) -> Result<tokio::sync::OwnedMutexGuard<Session>, DbError> {
        let mut session = self.session(sid)?.lock_owned().await;
        session.last_used = Instant::now();
        Ok(session)
    }

    // -- Database operations --------------------------------------------------

    pub async fn open(&self, sid: &str, name: &str) -> Result<(), DbError> {
        let mut session = self.lock(sid).await?;
        if session.transaction.is_some() {
            return Err(DbError::Protocol {
                message: "cannot open another database inside a transaction".to_string(),
            });
        }
        let exists = self.raft.fsm().with_engine(|e| Ok(e.has_database(name)))?;
        if !exists {
            return Err(DbError::NotFound {
                name: name.to_string(),
            });
        }
        session.database = Some(name.to_string());
        Ok(())
    }

    pub async fn prepare(&self, sid: &str, sql: &str) -> Result<PrepareResponse, DbError> {
        let mut session = self.lock(sid).await?;
        let database = session.database()?;
        let info = self
            .raft
            .fsm()
            .with_engine(|e| e.describe(&database, session.preamble(), sql))?;
        let stmt_id = session.next_stmt_id;
        session.next_stmt_id += 1;
        let response = PrepareResponse {
            stmt_id,
            param_count: info.param_count,
            readonly: info.kind == StatementKind::Read,
        };
        session.statements.insert(
            stmt_id,
            Prepared {
                sql: sql.to_string(),
                info,
            },
        );
        Ok(response)
    }

    pub async fn exec(
        &self,
        sid: &str,
        stmt_id: u32,
        params: Vec<Value>,
    ) -> Result<ExecResult, DbError> {
        let mut session = self.lock(sid).await?;
        let database = session.database()?;
        let prepared = session.statement(stmt_id)?;
        let kind = prepared.info.kind;
        let statement = bind(prepared, params)?;

        match kind {
            StatementKind::Begin => {
                if session.transaction.is_some() {
                    return Err(DbError::Engine {
                        message: "cannot start a transaction within a transaction".to_string(),
                    });
                }
                let status = self.raft.status();
                if !status.is_leader() {
                    return Err(DbError::NotLeader {
                        leader: status.leader,
                    });
                }
                session.transaction = Some(PendingTransaction {
                    term: status.term,
                    statements: Vec::new(),
                });
                Ok(ExecResult::default())
            }
            StatementKind::Commit => {
                let transaction = session.transaction.take().ok_or_else(|| DbError::Engine {
                    message: "cannot commit - no transaction is active".to_string(),
                })?;
                self.check_term(transaction.term)?;
                if transaction.statements.is_empty() {
                    return Ok(ExecResult::default());
                }
                self.raft
                    .propose(SqlCommand {
                        database,
                        statements: transaction.statements,
                    })
                    .await
            }
            StatementKind::Rollback => {
                session.transaction.take().ok_or_else(|| DbError::Engine {
                    message: "cannot rollback - no transaction is active".to_string(),
                })?;
                Ok(ExecResult::default())
            }
            StatementKind::Write => {
                check_deterministic_params(&statement)?;
                let Some(term) = session.transaction.as_ref().map(|t| t.term) else {
                    return self
                        .raft
                        .propose(SqlCommand {
                            database,
                            statements: vec![statement],
                        })
                        .await;
                };
                if let Err(err) = self.check_term(term) {
                    session.transaction = None;
                    return Err(err);
                }
                let result = self
                    .raft
                    .fsm()
                    .with_engine(|e| e.preview(&database, session.preamble(), &statement))?;
                if let Some(transaction) = session.transaction.as_mut() {
                    transaction.statements.push(statement);
                }
                Ok(result)
            }
            StatementKind::Read => {
                self.check_read()?;
                self.raft
                    .fsm()
                    .with_engine(|e| e.run_read(&database, session.preamble(), &statement))?;
                Ok(ExecResult::default())
            }
        }
    }

    pub async fn query(
        &self,
        sid: &str,
        stmt_id: u32,
        params: Vec<Value>,
    ) -> Result<QueryResponse, DbError> {
        let mut session = self.lock(sid).await?;
        let database = session.database()?;
        let prepared = session.statement(stmt_id)?;
        if prepared.info.kind != StatementKind::Read {
            return Err(DbError::Protocol {
                message: "statement is not read-only; use exec".to_string(),
            });
        }
        let statement = bind(prepared, params)?;
        self.check_read()?;
        let result = self
            .raft
            .fsm()
            .with_engine(|e| {
                e.query_limited(&database, session.preamble(), &statement, self.max_result_rows)
            })?;

        let mut remaining: VecDeque<Vec<Value>> = result.rows.into();
        let rows = take_batch(&mut remaining, self.batch_size);
        if remaining.is_empty() {
            return Ok(QueryResponse {
                rows_id: None,
                columns: result.columns,
                rows,
                done: true,
            });
        }
        let rows_id = session.next_rows_id;
        session.next_rows_id += 1;
        session.cursors.insert(rows_id, remaining);
        Ok(QueryResponse {
            rows_id: Some(rows_id),
            columns: result.columns,
            rows,
            done: false,
        })
    }

    /// Next batch of an open cursor.  The cursor closes once drained.
    pub async fn next(&self, sid: &str, rows_id: u32) -> Result<RowsBatch, DbError> {
        let mut session = self.lock(sid).await?;
        let cursor = session
            .cursors
            .get_mut(&rows_id)
            .ok_or(DbError::NoSuchRows { id: rows_id })?;
        let rows = take_batch(cursor, self.batch_size);
        let done = cursor.is_empty();
        if done {
            session.cursors.remove(&rows_id);
        }
        Ok(RowsBatch { rows, done })
    }

    /// Release a prepared statement.  Closing twice is a no-op.
    pub async fn close_statement(&self, sid: &str, stmt_id: u32) -> Result<(), DbError> {
        self.lock(sid).await?.statements.remove(&stmt_id);
        Ok(())
    }

    /// Release a row cursor.  Closing twice is a no-op.
    pub async fn close_rows(&self, sid: &str, rows_id: u32) -> Result<(), DbError> {
        self.lock(sid).await?.cursors.remove(&rows_id);
        Ok(())
    }

    /// Prepare, execute and release in one call.
    pub async fn exec_sql(
        &self,
        sid: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, DbError> {
        let prepared = self.prepare(sid, sql).await?;
        let result = self.exec(sid, prepared.stmt_id, params).await;
        self.close_statement(sid, prepared.stmt_id).await?;
        result
    }

    /// Prepare, query and release in one call.
    pub async fn query_sql(
        &self,
        sid: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<QueryResponse, DbError> {
        let prepared = self.prepare(sid, sql).await?;
        let result = self.query(sid, prepared.stmt_id, params).await;
        self.close_statement(sid, prepared.stmt_id).await?;
        result
    }

    /// Deterministic dump of the session's database on this node.
    pub async fn dump(&self, sid: &str) -> Result<crate::fsm::snapshot::DatabaseDump, DbError> {
        let session = self.lock(sid).await?;
        let database = session.database()?;
        self.raft.fsm().dump(&database)
    }

    // -- Cluster operations ---------------------------------------------------

    pub async fn add(&self, sid: &str, id: NodeId, address: &str) -> Result<(), DbError> {
        self.lock(sid).await?;
        self.raft.add_member(id, address).await
    }

    pub async fn assign(&self, sid: &str, id: NodeId, role: Role) -> Result<(), DbError> {
        self.lock(sid).await?;
        self.raft.assign_role(id, role).await
    }

    pub async fn remove(&self, sid: &str, id: NodeId) -> Result<(), DbError> {
        self.lock(sid).await?;
        self.raft.remove_member(id).await
    }

    pub async fn transfer(&self, sid: &str, id: NodeId) -> Result<(), DbError> {
        self.lock(sid).await?;
        self.raft.transfer_leadership(id).await
    }

    pub async fn cluster(&self, sid: &str) -> Result<Configuration, DbError> {
        self.lock(sid).await?;
        self.raft.configuration().await
    }

    pub async fn leader(&self, sid: &str) -> Result<Option<NodeInfo>, DbError> {
        self.lock(sid).await?;
        Ok(self.raft.status().leader)
    }

    // -- Helpers --------------------------------------------------------------

    /// A transaction opened in `term` may only continue while this node
    /// still leads that term.
    fn check_term(&self, term: u64) -> Result<(), DbError> {
        let status = self.raft.status();
        if status.is_leader() && status.term == term {
            return Ok(());
        }
        debug!(opened = term, current = status.term, "discarding stale transaction");
        Err(DbError::NotLeader {
            leader: if status.is_leader() { None } else { status.leader },
        })
    }

    fn check_read(&self) -> Result<(), DbError> {
        if self.consistency == ReadConsistency::Any {
            return Ok(());
        }
        let status = self.raft.status();
        if status.leader_ready {
            return Ok(());
        }
        if status.is_leader() {
            return Err(DbError::NotReady);
        }
        Err(DbError::NotLeader {
            leader: status.leader,
        })
    }
}

fn bind(prepared: &Prepared, params: Vec<Value>) -> Result<SqlStatement, DbError> {
    if params.len() != prepared.info.param_count {
        return Err(DbError::Protocol {
            message: format!(
                "statement takes {} parameters, {} given",
                prepared.info.param_count,
                params.len()
            ),
        });
    }
    Ok(SqlStatement::new(prepared.sql.clone(), params))
}

fn take_batch(rows: &mut VecDeque<Vec<Value>>, size: usize) -> Vec<Vec<Value>> {
    let n = size.min(rows.len());
    rows.drain(..n).collect()
}
