//! Session and SQL handlers under `/v1`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::DbError;
use crate::fsm::engine::{ExecResult, Value};
use crate::fsm::snapshot::DatabaseDump;
use crate::session::{HandshakeResponse, PrepareResponse, QueryResponse, RowsBatch};
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub sql: String,
}

/// Body of `exec` and `query` against a prepared statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementRequest {
    pub stmt_id: u32,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Body of the one-shot `exec_sql` and `query_sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// `POST /v1/handshake`
pub async fn handshake(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HandshakeRequest>,
) -> Result<(StatusCode, Json<HandshakeResponse>), DbError> {
    let response = state.sessions.handshake(body.version)?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// `DELETE /v1/sessions/{sid}`
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<StatusCode, DbError> {
    state.sessions.disconnect(&sid)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/sessions/{sid}/open`
pub async fn open(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<OpenRequest>,
) -> Result<StatusCode, DbError> {
    state.sessions.open(&sid, &body.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prepare(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<PrepareRequest>,
) -> Result<Json<PrepareResponse>, DbError> {
    Ok(Json(state.sessions.prepare(&sid, &body.sql).await?))
}

pub async fn exec(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<StatementRequest>,
) -> Result<Json<ExecResult>, DbError> {
    let result = state.sessions.exec(&sid, body.stmt_id, body.params).await?;
    Ok(Json(result))
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<StatementRequest>,
) -> Result<Json<QueryResponse>, DbError> {
    let result = state.sessions.query(&sid, body.stmt_id, body.params).await?;
    Ok(Json(result))
}

/// `POST /v1/sessions/{sid}/rows/{rows_id}/next`
pub async fn next(
    State(state): State<Arc<AppState>>,
    Path((sid, rows_id)): Path<(String, u32)>,
) -> Result<Json<RowsBatch>, DbError> {
    Ok(Json(state.sessions.next(&sid, rows_id).await?))
}

pub async fn close_statement(
    State(state): State<Arc<AppState>>,
    Path((sid, stmt_id)): Path<(String, u32)>,
) -> Result<StatusCode, DbError> {
    state.sessions.close_statement(&sid, stmt_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn close_rows(
    State(state): State<Arc<AppState>>,
    Path((sid, rows_id)): Path<(String, u32)>,
) -> Result<StatusCode, DbError> {
    state.sessions.close_rows(&sid, rows_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn exec_sql(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<SqlRequest>,
) -> Result<Json<ExecResult>, DbError> {
    let result = state.sessions.exec_sql(&sid, &body.sql, body.params).await?;
    Ok(Json(result))
}

pub async fn query_sql(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<SqlRequest>,
) -> Result<Json<QueryResponse>, DbError> {
    let result = state.sessions.query_sql(&sid, &body.sql, body.params).await?;
    Ok(Json(result))
}

/// `GET /v1/sessions/{sid}/dump`
pub async fn dump(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<DatabaseDump>, DbError> {
    Ok(Json(state.sessions.dump(&sid).await?))
}
