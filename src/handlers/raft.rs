//! Peer RPC endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::debug;

use crate::cluster::messages::Message;
use crate::AppState;

/// `POST /raft/message` -- one-way delivery into the consensus task.
/// Replies travel back as separate messages.
pub async fn message(State(state): State<Arc<AppState>>, Json(message): Json<Message>) -> StatusCode {
    debug!(from = message.from, kind = message.body.kind(), "peer message");
    state.raft.deliver(message);
    StatusCode::ACCEPTED
}
