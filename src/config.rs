//! Configuration loading and types for quorumlite.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, node identity and storage, consensus timing, the
//! served databases, logging and observability.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::membership::NodeId;
use crate::cluster::raft::RaftConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Node identity and local storage.
    #[serde(default)]
    pub node: NodeConfig,

    /// Consensus settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Served databases and client sessions.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Log store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    Sqlite,
    Memory,
}

/// This node's identity and local storage.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique, non-zero node id.
    #[serde(default = "default_node_id")]
    pub id: NodeId,

    /// `host:port` peers use to reach this node.
    #[serde(default = "default_address")]
    pub address: String,

    /// Directory for the log store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_log_store")]
    pub log_store: LogStoreKind,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            address: default_address(),
            data_dir: default_data_dir(),
            log_store: default_log_store(),
        }
    }
}

impl NodeConfig {
    pub fn log_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("raft.db")
    }
}

/// An initial voter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
}

/// Consensus configuration.  Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Write the initial membership entry if the log is empty.
    #[serde(default)]
    pub bootstrap: bool,

    /// Other initial voters, used only when bootstrapping.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,

    #[serde(default = "default_promotion_timeout")]
    pub promotion_timeout_ms: u64,

    /// Applied entries between snapshots (0 disables snapshots).
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Entries kept behind a snapshot.
    #[serde(default = "default_snapshot_trailing")]
    pub snapshot_trailing: u64,

    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            peers: Vec::new(),
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            apply_timeout_ms: default_apply_timeout(),
            transfer_timeout_ms: default_transfer_timeout(),
            promotion_timeout_ms: default_promotion_timeout(),
            snapshot_threshold: default_snapshot_threshold(),
            snapshot_trailing: default_snapshot_trailing(),
            max_append_entries: default_max_append_entries(),
        }
    }
}

impl ClusterConfig {
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
            promotion_timeout: Duration::from_millis(self.promotion_timeout_ms),
            snapshot_threshold: self.snapshot_threshold,
            snapshot_trailing: self.snapshot_trailing,
            max_append_entries: self.max_append_entries,
        }
    }
}

/// Where read-only queries may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConsistency {
    /// Only the leader serves reads, after its term barrier is applied.
    Leader,
    /// Any node serves reads from its local, possibly stale, state.
    Any,
}

/// Served databases and session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Logical databases served cluster-wide.
    #[serde(default = "default_database_names")]
    pub names: Vec<String>,

    #[serde(default = "default_read_consistency")]
    pub read_consistency: ReadConsistency,

    /// Idle session lifetime in seconds.
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout: u64,

    /// Rows returned per `QUERY`/`NEXT` response.
    #[serde(default = "default_rows_batch_size")]
    pub rows_batch_size: usize,

    /// Largest result a single `QUERY` may produce.  The whole result is
    /// held in memory until the cursor drains, so this bounds memory per
    /// open cursor.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            names: default_database_names(),
            read_consistency: default_read_consistency(),
            session_idle_timeout: default_session_idle_timeout(),
            rows_batch_size: default_rows_batch_size(),
            max_result_rows: default_max_result_rows(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and the `/health` probe.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/health`.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_node_id() -> NodeId {
    1
}

fn default_address() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_store() -> LogStoreKind {
    LogStoreKind::Sqlite
}

fn default_election_timeout() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    100
}

fn default_apply_timeout() -> u64 {
    5000
}

fn default_transfer_timeout() -> u64 {
    5000
}

fn default_promotion_timeout() -> u64 {
    10000
}

fn default_snapshot_threshold() -> u64 {
    1024
}

fn default_snapshot_trailing() -> u64 {
    8192
}

fn default_max_append_entries() -> usize {
    64
}

fn default_database_names() -> Vec<String> {
    vec!["main".to_string()]
}

fn default_read_consistency() -> ReadConsistency {
    ReadConsistency::Leader
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_rows_batch_size() -> usize {
    256
}

fn default_max_result_rows() -> usize {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id == 0 {
            anyhow::bail!("node.id must be non-zero");
        }
        if self.node.address.is_empty() {
            anyhow::bail!("node.address must be set");
        }
        if self.database.names.is_empty() {
            anyhow::bail!("database.names must list at least one database");
        }
        if self.database.max_result_rows == 0 {
            anyhow::bail!("database.max_result_rows must be positive");
        }
        if self.database.rows_batch_size == 0 {
            anyhow::bail!("database.rows_batch_size must be positive");
        }
        let cluster = &self.cluster;
        if cluster.heartbeat_interval_ms == 0
            || cluster.heartbeat_interval_ms >= cluster.election_timeout_ms
        {
            anyhow::bail!(
                "cluster.heartbeat_interval_ms ({}) must be positive and below cluster.election_timeout_ms ({})",
                cluster.heartbeat_interval_ms,
                cluster.election_timeout_ms
            );
        }
        let mut seen = HashSet::from([self.node.id]);
        for peer in &cluster.peers {
            if peer.id == 0 || !seen.insert(peer.id) {
                anyhow::bail!("cluster.peers has a zero or duplicate id {}", peer.id);
            }
        }
        Ok(())
    }

    /// Address the HTTP server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.node.log_store, LogStoreKind::Sqlite);
        assert_eq!(config.database.names, vec!["main".to_string()]);
        assert_eq!(config.database.read_consistency, ReadConsistency::Leader);
        assert_eq!(config.cluster.election_timeout_ms, 1000);
        assert!(!config.cluster.bootstrap);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_file() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9101
node:
  id: 2
  address: 127.0.0.1:9101
  data_dir: /tmp/q2
  log_store: memory
cluster:
  bootstrap: true
  peers:
    - id: 1
      address: 127.0.0.1:9100
  election_timeout_ms: 300
  heartbeat_interval_ms: 50
database:
  names: [main, audit]
  read_consistency: any
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:9101");
        assert_eq!(config.node.log_store, LogStoreKind::Memory);
        assert_eq!(config.node.log_path(), Path::new("/tmp/q2").join("raft.db"));
        assert_eq!(config.cluster.peers[0].id, 1);
        assert_eq!(config.database.read_consistency, ReadConsistency::Any);
        let raft = config.cluster.raft_config();
        assert_eq!(raft.election_timeout, Duration::from_millis(300));
        assert_eq!(raft.snapshot_threshold, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.node.id = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.names.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.heartbeat_interval_ms = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.peers = vec![PeerConfig {
            id: 1,
            address: "127.0.0.1:9002".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quorumlite.yaml");
        std::fs::write(&path, "node:\n  id: 3\n").unwrap();
        assert_eq!(load_config(&path).unwrap().node.id, 3);

        std::fs::write(&path, "node:\n  id: 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
