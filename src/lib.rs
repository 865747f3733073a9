//! quorumlite -- a SQL database replicated with Raft.
//!
//! Every node embeds SQLite.  Writes are proposed to the consensus log
//! and applied on every replica in log order; clients talk to any node
//! over an HTTP/JSON session protocol and are redirected to the leader
//! when a request needs one.

use std::iter;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod fsm;
pub mod handlers;
pub mod logstore;
pub mod metrics;
pub mod server;
pub mod session;

use crate::cluster::membership::Configuration;
use crate::cluster::node::RaftNode;
use crate::cluster::raft::RaftCore;
use crate::cluster::transport::Transport;
use crate::config::{Config, LogStoreKind};
use crate::fsm::state_machine::StateMachine;
use crate::logstore::memory::MemoryLogStore;
use crate::logstore::sqlite::SqliteLogStore;
use crate::logstore::store::LogStore;
use crate::session::SessionManager;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Node configuration.
    pub config: Config,
    /// Handle to the consensus task.
    pub raft: RaftNode,
    /// Client sessions on this node.
    pub sessions: Arc<SessionManager>,
}

/// Open the log store, recover the state machine, bootstrap if asked to,
/// and start the consensus task and the session reaper.
///
/// Must be called from within a tokio runtime.
pub fn start_node(config: Config, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<AppState>> {
    let fsm = Arc::new(StateMachine::new(&config.database.names)?);

    let store: Box<dyn LogStore> = match config.node.log_store {
        LogStoreKind::Sqlite => {
            std::fs::create_dir_all(&config.node.data_dir)?;
            let path = config.node.log_path();
            info!("SQLite log store at {}", path.display());
            Box::new(SqliteLogStore::open(path)?)
        }
        LogStoreKind::Memory => Box::new(MemoryLogStore::new()),
    };

    let raft_config = config.cluster.raft_config();
    let mut core = RaftCore::new(
        config.node.id,
        config.node.address.clone(),
        raft_config.clone(),
        store,
        fsm.clone(),
        Instant::now(),
    )?;

    if config.cluster.bootstrap {
        let voters = iter::once((config.node.id, config.node.address.clone())).chain(
            config
                .cluster
                .peers
                .iter()
                .map(|peer| (peer.id, peer.address.clone())),
        );
        if core.bootstrap(Configuration::with_voters(voters))? {
            info!(id = config.node.id, "bootstrapped new cluster");
        } else {
            info!(id = config.node.id, "existing log found, skipping bootstrap");
        }
    }

    let raft = RaftNode::spawn(core, fsm, transport, &raft_config);
    let sessions = Arc::new(SessionManager::new(raft.clone(), &config.database));
    sessions.spawn_reaper();

    Ok(Arc::new(AppState {
        config,
        raft,
        sessions,
    }))
}
