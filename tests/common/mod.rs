//! In-process cluster harness.  Nodes run their real consensus tasks and
//! session managers and talk over a [`LocalNetwork`].

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quorumlite::cluster::membership::NodeId;
use quorumlite::cluster::transport::LocalNetwork;
use quorumlite::config::{Config, LogStoreKind, PeerConfig, ReadConsistency};
use quorumlite::errors::DbError;
use quorumlite::fsm::engine::{ExecResult, Value};
use quorumlite::session::PROTOCOL_VERSION;
use quorumlite::AppState;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn address(id: NodeId) -> String {
    format!("node{id}")
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: BTreeMap<NodeId, Arc<AppState>>,
    pub tweak: fn(&mut Config),
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    /// A cluster whose node configs are adjusted by `tweak`.
    pub fn with(tweak: fn(&mut Config)) -> Self {
        Self {
            network: Arc::new(LocalNetwork::new()),
            nodes: BTreeMap::new(),
            tweak,
        }
    }

    /// Start `n` nodes that bootstrap the same voter set `1..=n`.
    pub async fn voters(n: NodeId) -> Self {
        let mut cluster = Self::new();
        let ids: Vec<NodeId> = (1..=n).collect();
        for id in &ids {
            cluster.start(*id, &ids);
        }
        cluster.wait_for_leader().await;
        cluster
    }

    /// Start a node.  A non-empty `bootstrap` set makes it bootstrap with
    /// those voters; otherwise it waits to be added.
    pub fn start(&mut self, id: NodeId, bootstrap: &[NodeId]) -> Arc<AppState> {
        let mut config = Config::default();
        config.node.id = id;
        config.node.address = address(id);
        config.node.log_store = LogStoreKind::Memory;
        config.cluster.bootstrap = !bootstrap.is_empty();
        config.cluster.peers = bootstrap
            .iter()
            .filter(|peer| **peer != id)
            .map(|peer| PeerConfig {
                id: *peer,
                address: address(*peer),
            })
            .collect();
        config.cluster.election_timeout_ms = 150;
        config.cluster.heartbeat_interval_ms = 20;
        config.cluster.promotion_timeout_ms = 5000;
        config.database.read_consistency = ReadConsistency::Any;
        (self.tweak)(&mut config);

        let state = quorumlite::start_node(config, self.network.clone()).unwrap();
        self.network.register(address(id), state.raft.clone());
        self.nodes.insert(id, state.clone());
        state
    }

    pub fn node(&self, id: NodeId) -> &Arc<AppState> {
        &self.nodes[&id]
    }

    /// Wait for a leader that has applied its barrier and is reachable.
    pub async fn wait_for_leader(&self) -> NodeId {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            let leader = self
                .nodes
                .values()
                .map(|n| n.raft.status())
                .filter(|s| s.is_leader() && s.leader_ready && !self.network.is_isolated(s.id))
                .max_by_key(|s| s.term);
            if let Some(status) = leader {
                return status.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    /// Wait until node `id` leads and has applied its barrier.
    pub async fn wait_until_leader(&self, id: NodeId) {
        let mut status = self.node(id).raft.subscribe();
        tokio::time::timeout(TIMEOUT, status.wait_for(|s| s.is_leader() && s.leader_ready))
            .await
            .unwrap_or_else(|_| panic!("node {id} did not become leader"))
            .unwrap();
    }

    /// Wait until every listed node has applied everything `from` has.
    pub async fn wait_caught_up(&self, from: NodeId, ids: &[NodeId]) {
        let index = self.node(from).raft.fsm().last_applied();
        for id in ids {
            self.node(*id)
                .raft
                .fsm()
                .wait_for_applied(index, TIMEOUT)
                .await
                .unwrap_or_else(|err| panic!("node {id} did not reach {index}: {err}"));
        }
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.raft.shutdown().await;
        }
    }
}

/// Open a session on `state` with the `main` database selected.
pub async fn session(state: &AppState) -> String {
    let sid = state
        .sessions
        .handshake(PROTOCOL_VERSION)
        .unwrap()
        .session_id;
    state.sessions.open(&sid, "main").await.unwrap();
    sid
}

pub async fn exec(state: &AppState, sql: &str) -> Result<ExecResult, DbError> {
    let sid = session(state).await;
    let result = state.sessions.exec_sql(&sid, sql, vec![]).await;
    state.sessions.disconnect(&sid).unwrap();
    result
}

/// Run `sql` on whichever node leads, retrying while leadership settles.
/// `sql` must be safe to apply twice.
pub async fn exec_on_leader(cluster: &TestCluster, sql: &str) -> (NodeId, ExecResult) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let leader = cluster.wait_for_leader().await;
        match exec(cluster.node(leader), sql).await {
            Ok(result) => return (leader, result),
            Err(err) if err.is_retryable() && Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => panic!("{sql}: {err}"),
        }
    }
}

/// Row count of `table` in this node's local state.
pub async fn count(state: &AppState, table: &str) -> i64 {
    let sid = session(state).await;
    let result = state
        .sessions
        .query_sql(&sid, &format!("SELECT count(*) FROM {table}"), vec![])
        .await
        .unwrap();
    state.sessions.disconnect(&sid).unwrap();
    match result.rows[0][0] {
        Value::Integer(n) => n,
        ref other => panic!("unexpected {other:?}"),
    }
}
