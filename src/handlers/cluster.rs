//! Cluster administration handlers under `/v1/sessions/{sid}/cluster`.
//!
//! Mutations are accepted only by the leader; other nodes answer
//! `NotLeader` with the current leader as redirect hint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::membership::{NodeId, NodeInfo, Role};
use crate::errors::DbError;
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRequest {
    pub id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub id: NodeId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub id: NodeId,
}

/// `id = 0` lets the leader pick the most up-to-date voter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(default)]
    pub id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader: Option<NodeInfo>,
}

pub async fn add(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<AddRequest>,
) -> Result<StatusCode, DbError> {
    state.sessions.add(&sid, body.id, &body.address).await?;
    info!(id = body.id, address = %body.address, "node added");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<AssignRequest>,
) -> Result<StatusCode, DbError> {
    state.sessions.assign(&sid, body.id, body.role).await?;
    info!(id = body.id, role = body.role.as_str(), "role assigned");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<RemoveRequest>,
) -> Result<StatusCode, DbError> {
    state.sessions.remove(&sid, body.id).await?;
    info!(id = body.id, "node removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn transfer(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<TransferRequest>,
) -> Result<StatusCode, DbError> {
    state.sessions.transfer(&sid, body.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/sessions/{sid}/cluster`
pub async fn cluster(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<ClusterResponse>, DbError> {
    let configuration = state.sessions.cluster(&sid).await?;
    Ok(Json(ClusterResponse {
        nodes: configuration.to_vec(),
    }))
}

/// `GET /v1/sessions/{sid}/leader`
pub async fn leader(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<LeaderResponse>, DbError> {
    let leader = state.sessions.leader(&sid).await?;
    Ok(Json(LeaderResponse { leader }))
}
