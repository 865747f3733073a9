//! Axum router construction.
//!
//! The [`app`] function wires the client protocol, the peer RPC endpoint
//! and the operational endpoints to their handlers and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::cluster::membership::NodeInfo;
use crate::errors::generate_request_id;
use crate::handlers::{cluster, raft, session};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] for one node.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/v1/handshake", post(session::handshake))
        .route("/v1/sessions/:sid", delete(session::disconnect))
        .route("/v1/sessions/:sid/open", post(session::open))
        .route("/v1/sessions/:sid/prepare", post(session::prepare))
        .route("/v1/sessions/:sid/exec", post(session::exec))
        .route("/v1/sessions/:sid/query", post(session::query))
        .route("/v1/sessions/:sid/exec_sql", post(session::exec_sql))
        .route("/v1/sessions/:sid/query_sql", post(session::query_sql))
        .route("/v1/sessions/:sid/rows/:id/next", post(session::next))
        .route("/v1/sessions/:sid/rows/:id", delete(session::close_rows))
        .route(
            "/v1/sessions/:sid/statements/:id",
            delete(session::close_statement),
        )
        .route("/v1/sessions/:sid/dump", get(session::dump))
        .route("/v1/sessions/:sid/cluster", get(cluster::cluster))
        .route("/v1/sessions/:sid/cluster/add", post(cluster::add))
        .route("/v1/sessions/:sid/cluster/assign", post(cluster::assign))
        .route("/v1/sessions/:sid/cluster/remove", post(cluster::remove))
        .route("/v1/sessions/:sid/cluster/transfer", post(cluster::transfer))
        .route("/v1/sessions/:sid/leader", get(cluster::leader))
        .route("/raft/message", post(raft::message));

    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("quorumlite"));

    response
}

// -- Health ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub id: u64,
    pub role: String,
    pub term: u64,
    pub leader: Option<NodeInfo>,
    pub commit_index: u64,
    pub applied: u64,
}

/// `GET /health` -- this node's view of the cluster.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.raft.status();
    let body = HealthResponse {
        status: "ok".to_string(),
        id: status.id,
        role: status.role.as_str().to_string(),
        term: status.term,
        leader: status.leader,
        commit_index: status.commit_index,
        applied: status.last_applied,
    };
    (StatusCode::OK, Json(body))
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::LocalNetwork;
    use crate::config::{Config, LogStoreKind};
    use crate::errors::ErrorBody;
    use crate::fsm::engine::{ExecResult, Value};
    use crate::session::{HandshakeResponse, PrepareResponse, QueryResponse, RowsBatch};
    use crate::handlers::cluster::{ClusterResponse, LeaderResponse};
    use axum::body::Body;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let mut config = Config::default();
        config.node.address = "@1".to_string();
        config.node.log_store = LogStoreKind::Memory;
        config.cluster.bootstrap = true;
        config.cluster.election_timeout_ms = 50;
        config.cluster.heartbeat_interval_ms = 10;
        config.database.rows_batch_size = 1;
        let state = crate::start_node(config, Arc::new(LocalNetwork::new())).unwrap();
        state
            .raft
            .wait_for_leader(Duration::from_secs(2))
            .await
            .unwrap();
        app(state)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn handshake(app: &Router) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/v1/handshake",
            Some(serde_json::json!({"version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let response: HandshakeResponse = serde_json::from_slice(&body).unwrap();
        let sid = response.session_id;
        let (status, _) = call(
            app,
            "POST",
            &format!("/v1/sessions/{sid}/open"),
            Some(serde_json::json!({"name": "main"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        sid
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.id, 1);
        assert_eq!(health.role, "leader");
        assert_eq!(health.leader.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_common_headers() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()["server"], "quorumlite");
        assert_eq!(response.headers()["x-request-id"].len(), 16);
        assert!(response.headers().contains_key("date"));
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_version() {
        let app = test_app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/v1/handshake",
            Some(serde_json::json!({"version": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "Protocol");
    }

    #[tokio::test]
    async fn test_sql_round_trip() {
        let app = test_app().await;
        let sid = handshake(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/exec_sql"),
            Some(serde_json::json!({"sql": "CREATE TABLE t (n INT, s TEXT)"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/prepare"),
            Some(serde_json::json!({"sql": "INSERT INTO t VALUES (?, ?)"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let prepared: PrepareResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(prepared.param_count, 2);

        for (n, s) in [(1, "a"), (2, "b")] {
            let (status, body) = call(
                &app,
                "POST",
                &format!("/v1/sessions/{sid}/exec"),
                Some(serde_json::json!({"stmt_id": prepared.stmt_id, "params": [n, s]})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let result: ExecResult = serde_json::from_slice(&body).unwrap();
            assert_eq!(result.last_insert_id, n);
        }

        let (status, _) = call(
            &app,
            "DELETE",
            &format!("/v1/sessions/{sid}/statements/{}", prepared.stmt_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/query_sql"),
            Some(serde_json::json!({"sql": "SELECT n, s FROM t ORDER BY n"})),
        )
        .await;
        let first: QueryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(first.columns, vec!["n", "s"]);
        assert_eq!(
            first.rows,
            vec![vec![Value::Integer(1), Value::Text("a".to_string())]]
        );
        let rows_id = first.rows_id.unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/rows/{rows_id}/next"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let batch: RowsBatch = serde_json::from_slice(&body).unwrap();
        assert!(batch.done);

        let (status, _) = call(&app, "DELETE", &format!("/v1/sessions/{sid}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", &format!("/v1/sessions/{sid}/dump"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "NoSuchSession");
    }

    #[tokio::test]
    async fn test_syntax_error_response() {
        let app = test_app().await;
        let sid = handshake(&app).await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/prepare"),
            Some(serde_json::json!({"sql": "SELEC 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "SyntaxError");
        assert!(error.message.contains("syntax error"));
    }

    #[tokio::test]
    async fn test_cluster_endpoints() {
        let app = test_app().await;
        let sid = handshake(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/cluster/add"),
            Some(serde_json::json!({"id": 2, "address": "@2"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, "GET", &format!("/v1/sessions/{sid}/cluster"), None).await;
        let cluster: ClusterResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(cluster.nodes.len(), 2);
        assert_eq!(cluster.nodes[1].role, crate::cluster::membership::Role::Spare);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/cluster/remove"),
            Some(serde_json::json!({"id": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "LastVoter");

        let (_, body) = call(&app, "GET", &format!("/v1/sessions/{sid}/leader"), None).await;
        let leader: LeaderResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(leader.leader.unwrap().address, "@1");
    }
}
