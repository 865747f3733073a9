//! HTTP client for the session protocol.
//!
//! A [`Client`] owns one server-side session.  It does not follow leader
//! redirects on its own; [`Client::connect_leader`] walks the `NotLeader`
//! hints once at connect time, and callers reconnect when leadership
//! moves.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::cluster::membership::{NodeId, NodeInfo, Role};
use crate::errors::ErrorBody;
use crate::fsm::engine::{ExecResult, QueryResult, Value};
use crate::fsm::snapshot::DatabaseDump;
use crate::handlers::cluster::{
    AddRequest, AssignRequest, ClusterResponse, LeaderResponse, RemoveRequest, TransferRequest,
};
use crate::handlers::session::{
    HandshakeRequest, OpenRequest, PrepareRequest, SqlRequest, StatementRequest,
};
use crate::session::{
    HandshakeResponse, PrepareResponse, QueryResponse, RowsBatch, PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{}: {}", .body.code, .body.message)]
    Server { status: u16, body: ErrorBody },

    #[error("no leader found among {0:?}")]
    NoLeader(Vec<String>),
}

impl ClientError {
    /// Stable error code reported by the server, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server { body, .. } => Some(&body.code),
            _ => None,
        }
    }

    /// Redirect hint carried by a `NotLeader` error.
    pub fn leader_hint(&self) -> Option<&NodeInfo> {
        match self {
            ClientError::Server { body, .. } => body.leader.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    http: reqwest::Client,
    base: String,
    session_id: String,
}

impl Client {
    /// Open a session on the node at `address` (`host:port`).
    pub async fn connect(address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base = format!("http://{address}");
        let response: HandshakeResponse = send(
            http.post(format!("{base}/v1/handshake"))
                .json(&HandshakeRequest {
                    version: PROTOCOL_VERSION,
                }),
        )
        .await?;
        debug!(address, session = %response.session_id, "connected");
        Ok(Self {
            http,
            base,
            session_id: response.session_id,
        })
    }

    /// Connect to whichever of `addresses` currently leads, following
    /// redirect hints.
    pub async fn connect_leader(addresses: &[String]) -> Result<Self> {
        for address in addresses {
            let Ok(client) = Client::connect(address).await else {
                continue;
            };
            match client.leader().await {
                Ok(Some(leader)) if leader.address == *address => return Ok(client),
                Ok(Some(leader)) => {
                    client.disconnect().await.ok();
                    if let Ok(client) = Client::connect(&leader.address).await {
                        return Ok(client);
                    }
                }
                _ => {
                    client.disconnect().await.ok();
                }
            }
        }
        Err(ClientError::NoLeader(addresses.to_vec()))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Base URL of the node this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/sessions/{}{}", self.base, self.session_id, path)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        send(self.http.post(self.url(path)).json(body)).await
    }

    async fn post_empty<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        send_empty(self.http.post(self.url(path)).json(body)).await
    }

    pub async fn disconnect(self) -> Result<()> {
        send_empty(self.http.delete(self.url(""))).await
    }

    pub async fn open(&self, name: &str) -> Result<()> {
        self.post_empty(
            "/open",
            &OpenRequest {
                name: name.to_string(),
            },
        )
        .await
    }

    pub async fn prepare(&self, sql: &str) -> Result<PrepareResponse> {
        self.post(
            "/prepare",
            &PrepareRequest {
                sql: sql.to_string(),
            },
        )
        .await
    }

    pub async fn exec(&self, stmt_id: u32, params: Vec<Value>) -> Result<ExecResult> {
        self.post("/exec", &StatementRequest { stmt_id, params })
            .await
    }

    /// Run a prepared query and drain its cursor.
    pub async fn query(&self, stmt_id: u32, params: Vec<Value>) -> Result<QueryResult> {
        let first: QueryResponse = self
            .post("/query", &StatementRequest { stmt_id, params })
            .await?;
        self.drain(first).await
    }

    pub async fn next(&self, rows_id: u32) -> Result<RowsBatch> {
        send(
            self.http
                .post(self.url(&format!("/rows/{rows_id}/next"))),
        )
        .await
    }

    pub async fn close_statement(&self, stmt_id: u32) -> Result<()> {
        send_empty(
            self.http
                .delete(self.url(&format!("/statements/{stmt_id}"))),
        )
        .await
    }

    pub async fn close_rows(&self, rows_id: u32) -> Result<()> {
        send_empty(self.http.delete(self.url(&format!("/rows/{rows_id}")))).await
    }

    pub async fn exec_sql(&self, sql: &str, params: Vec<Value>) -> Result<ExecResult> {
        self.post(
            "/exec_sql",
            &SqlRequest {
                sql: sql.to_string(),
                params,
            },
        )
        .await
    }

    /// One-shot query; drains every batch.
    pub async fn query_sql(&self, sql: &str, params: Vec<Value>) -> Result<QueryResult> {
        let first: QueryResponse = self
            .post(
                "/query_sql",
                &SqlRequest {
                    sql: sql.to_string(),
                    params,
                },
            )
            .await?;
        self.drain(first).await
    }

    async fn drain(&self, first: QueryResponse) -> Result<QueryResult> {
        let mut result = QueryResult {
            columns: first.columns,
            rows: first.rows,
        };
        if let Some(rows_id) = first.rows_id {
            loop {
                let batch = self.next(rows_id).await?;
                result.rows.extend(batch.rows);
                if batch.done {
                    break;
                }
            }
        }
        Ok(result)
    }

    pub async fn dump(&self) -> Result<DatabaseDump> {
        send(self.http.get(self.url("/dump"))).await
    }

    pub async fn add(&self, id: NodeId, address: &str) -> Result<()> {
        self.post_empty(
            "/cluster/add",
            &AddRequest {
                id,
                address: address.to_string(),
            },
        )
        .await
    }

    pub async fn assign(&self, id: NodeId, role: Role) -> Result<()> {
        self.post_empty("/cluster/assign", &AssignRequest { id, role })
            .await
    }

    pub async fn remove(&self, id: NodeId) -> Result<()> {
        self.post_empty("/cluster/remove", &RemoveRequest { id })
            .await
    }

    /// Transfer leadership; `0` lets the leader choose.
    pub async fn transfer(&self, id: NodeId) -> Result<()> {
        self.post_empty("/cluster/transfer", &TransferRequest { id })
            .await
    }

    pub async fn cluster(&self) -> Result<Vec<NodeInfo>> {
        let response: ClusterResponse = send(self.http.get(self.url("/cluster"))).await?;
        Ok(response.nodes)
    }

    pub async fn leader(&self) -> Result<Option<NodeInfo>> {
        let response: LeaderResponse = send(self.http.get(self.url("/leader"))).await?;
        Ok(response.leader)
    }
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = check(request.send().await?).await?;
    Ok(response.json().await?)
}

async fn send_empty(request: reqwest::RequestBuilder) -> Result<()> {
    check(request.send().await?).await?;
    Ok(())
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await?;
    let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| ErrorBody {
        code: status_code_name(status),
        message: text,
        request_id: String::new(),
        leader: None,
    });
    Err(ClientError::Server {
        status: status.as_u16(),
        body,
    })
}

fn status_code_name(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("Unknown")
        .replace(' ', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::LocalNetwork;
    use crate::config::{Config, LogStoreKind};
    use std::sync::Arc;

    /// Serve a bootstrapped single node on an ephemeral port.
    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut config = Config::default();
        config.node.address = address.clone();
        config.node.log_store = LogStoreKind::Memory;
        config.cluster.bootstrap = true;
        config.cluster.election_timeout_ms = 50;
        config.cluster.heartbeat_interval_ms = 10;
        let state = crate::start_node(config, Arc::new(LocalNetwork::new())).unwrap();
        state
            .raft
            .wait_for_leader(Duration::from_secs(2))
            .await
            .unwrap();
        let app = crate::server::app(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let address = serve().await;
        let client = Client::connect_leader(&[address.clone()]).await.unwrap();
        client.open("main").await.unwrap();
        client
            .exec_sql("CREATE TABLE t (n INT)", vec![])
            .await
            .unwrap();
        let insert = client.prepare("INSERT INTO t VALUES (?)").await.unwrap();
        for n in 0..300 {
            client
                .exec(insert.stmt_id, vec![Value::Integer(n)])
                .await
                .unwrap();
        }
        client.close_statement(insert.stmt_id).await.unwrap();

        // More rows than one batch.
        let result = client.query_sql("SELECT n FROM t", vec![]).await.unwrap();
        assert_eq!(result.rows.len(), 300);

        let leader = client.leader().await.unwrap().unwrap();
        assert_eq!(leader.address, address);
        assert_eq!(client.cluster().await.unwrap().len(), 1);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_decoded() {
        let address = serve().await;
        let client = Client::connect(&address).await.unwrap();
        let err = client.prepare("SELECT 1").await.unwrap_err();
        assert_eq!(err.code(), Some("Protocol"));
        client.open("main").await.unwrap();
        let err = client.exec_sql("SELEC 1", vec![]).await.unwrap_err();
        assert_eq!(err.code(), Some("SyntaxError"));
        assert!(err.leader_hint().is_none());
    }

    #[tokio::test]
    async fn test_connect_leader_fails_without_servers() {
        let err = Client::connect_leader(&["127.0.0.1:1".to_string()])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::NoLeader(_)));
    }
}
