//! Prometheus metrics for quorumlite.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "quorumlite_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "quorumlite_http_request_duration_seconds";

/// Proposals submitted to the consensus task (counter). Labels: outcome.
pub const PROPOSALS_TOTAL: &str = "quorumlite_proposals_total";

/// Elections started by this node (counter).
pub const ELECTIONS_TOTAL: &str = "quorumlite_elections_total";

/// Times this node became leader (counter).
pub const LEADER_CHANGES_TOTAL: &str = "quorumlite_leader_changes_total";

/// Snapshots (counter). Labels: kind (`taken`, `installed`).
pub const SNAPSHOTS_TOTAL: &str = "quorumlite_snapshots_total";

/// Current term (gauge).
pub const RAFT_TERM: &str = "quorumlite_raft_term";

/// Commit index (gauge).
pub const RAFT_COMMIT_INDEX: &str = "quorumlite_raft_commit_index";

/// Last applied index (gauge).
pub const RAFT_LAST_APPLIED: &str = "quorumlite_raft_last_applied";

/// Peer messages that could not be delivered (counter). Labels: reason.
pub const PEER_SEND_FAILURES_TOTAL: &str = "quorumlite_peer_send_failures_total";

/// Open client sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "quorumlite_sessions_active";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(PROPOSALS_TOTAL, "Proposals by outcome");
    describe_counter!(ELECTIONS_TOTAL, "Elections started by this node");
    describe_counter!(LEADER_CHANGES_TOTAL, "Times this node became leader");
    describe_counter!(SNAPSHOTS_TOTAL, "Snapshots taken or installed");
    describe_gauge!(RAFT_TERM, "Current consensus term");
    describe_gauge!(RAFT_COMMIT_INDEX, "Highest committed log index");
    describe_gauge!(RAFT_LAST_APPLIED, "Highest applied log index");
    describe_counter!(PEER_SEND_FAILURES_TOTAL, "Undelivered peer messages");
    describe_gauge!(SESSIONS_ACTIVE, "Open client sessions");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Session, statement and cursor ids are replaced so labels stay
/// low-cardinality.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/v1/handshake` -> `/v1/handshake`
/// - `/v1/sessions/3f2a.../exec` -> `/v1/sessions/{sid}/exec`
/// - `/v1/sessions/3f2a.../rows/4/next` -> `/v1/sessions/{sid}/rows/{id}/next`
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["v1", "sessions", _] => "/v1/sessions/{sid}".to_string(),
        ["v1", "sessions", _, kind @ ("rows" | "statements"), _, rest @ ..] => {
            let mut out = format!("/v1/sessions/{{sid}}/{kind}/{{id}}");
            for segment in rest {
                out.push('/');
                out.push_str(segment);
            }
            out
        }
        ["v1", "sessions", _, rest @ ..] => format!("/v1/sessions/{{sid}}/{}", rest.join("/")),
        _ => path.to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    };
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_static() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/raft/message"), "/raft/message");
        assert_eq!(normalize_path("/v1/handshake"), "/v1/handshake");
    }

    #[test]
    fn test_normalize_path_session() {
        assert_eq!(normalize_path("/v1/sessions/abc"), "/v1/sessions/{sid}");
        assert_eq!(
            normalize_path("/v1/sessions/abc/exec"),
            "/v1/sessions/{sid}/exec"
        );
        assert_eq!(
            normalize_path("/v1/sessions/abc/cluster/add"),
            "/v1/sessions/{sid}/cluster/add"
        );
    }

    #[test]
    fn test_normalize_path_cursor() {
        assert_eq!(
            normalize_path("/v1/sessions/abc/rows/7/next"),
            "/v1/sessions/{sid}/rows/{id}/next"
        );
        assert_eq!(
            normalize_path("/v1/sessions/abc/statements/2"),
            "/v1/sessions/{sid}/statements/{id}"
        );
    }
}
