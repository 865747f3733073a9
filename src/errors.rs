//! Client-visible error types.
//!
//! Every variant maps to a stable error code string.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(DbError::NotLeader { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::membership::{NodeId, NodeInfo};

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced to clients and peers.
#[derive(Debug, Error)]
pub enum DbError {
    /// This node cannot serve the request; retry against the leader.
    #[error("not leader")]
    NotLeader { leader: Option<NodeInfo> },

    /// The proposal did not commit in time. It may still commit later.
    #[error("timed out waiting for the entry to commit; outcome unknown")]
    Timeout,

    /// Leadership was lost before the proposal committed.
    #[error("leadership lost before the entry committed; outcome unknown")]
    LeadershipLost,

    /// A node with the same id or address is already a member.
    #[error("{message}")]
    Duplicate { message: String },

    /// No member with the given id.
    #[error("no member with id {id}")]
    UnknownMember { id: NodeId },

    /// The change would leave the cluster without voters.
    #[error("cannot remove or demote the last voter")]
    LastVoter,

    /// Another membership change or leadership transfer is in flight.
    #[error("a membership change or leadership transfer is already in progress")]
    ChangeInProgress,

    /// A snapshot installation or catch-up is in progress.
    #[error("node is not ready, retry later")]
    NotReady,

    /// No such logical database is configured.
    #[error("no database named {name}")]
    NotFound { name: String },

    /// The transfer target is not a voting member.
    #[error("no voting member with id {id}")]
    UnknownTarget { id: NodeId },

    /// The transfer target did not catch up in time.
    #[error("leadership transfer timed out; leadership stays with this node")]
    TransferTimeout,

    /// The SQL text did not parse.
    #[error("{message}")]
    SyntaxError { message: String },

    /// An error reported by the embedded SQL engine, passed through verbatim.
    #[error("{message}")]
    Engine { message: String },

    /// The statement is valid SQL but cannot be replicated.
    #[error("{message}")]
    Unsupported { message: String },

    /// The request violates the control protocol.
    #[error("{message}")]
    Protocol { message: String },

    /// Unknown or expired session id.
    #[error("no such session")]
    NoSuchSession,

    /// Unknown prepared statement id.
    #[error("no prepared statement with id {id}")]
    NoSuchStatement { id: u32 },

    /// Unknown row cursor id.
    #[error("no row cursor with id {id}")]
    NoSuchRows { id: u32 },

    /// The query produced more rows than a cursor may hold.
    #[error("query result exceeds {limit} rows; narrow it with WHERE or LIMIT")]
    ResultTooLarge { limit: usize },

    /// The node is shutting down.
    #[error("node is shutting down")]
    Shutdown,

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl DbError {
    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::NotLeader { .. } => "NotLeader",
            DbError::Timeout => "Timeout",
            DbError::LeadershipLost => "LeadershipLost",
            DbError::Duplicate { .. } => "Duplicate",
            DbError::UnknownMember { .. } => "UnknownMember",
            DbError::LastVoter => "LastVoter",
            DbError::ChangeInProgress => "ChangeInProgress",
            DbError::NotReady => "NotReady",
            DbError::NotFound { .. } => "NotFound",
            DbError::UnknownTarget { .. } => "UnknownTarget",
            DbError::TransferTimeout => "TransferTimeout",
            DbError::SyntaxError { .. } => "SyntaxError",
            DbError::Engine { .. } => "Engine",
            DbError::Unsupported { .. } => "Unsupported",
            DbError::Protocol { .. } => "Protocol",
            DbError::NoSuchSession => "NoSuchSession",
            DbError::NoSuchStatement { .. } => "NoSuchStatement",
            DbError::NoSuchRows { .. } => "NoSuchRows",
            DbError::ResultTooLarge { .. } => "ResultTooLarge",
            DbError::Shutdown => "Shutdown",
            DbError::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DbError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            DbError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DbError::LeadershipLost => StatusCode::SERVICE_UNAVAILABLE,
            DbError::Duplicate { .. } => StatusCode::CONFLICT,
            DbError::UnknownMember { .. } => StatusCode::NOT_FOUND,
            DbError::LastVoter => StatusCode::CONFLICT,
            DbError::ChangeInProgress => StatusCode::CONFLICT,
            DbError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            DbError::NotFound { .. } => StatusCode::NOT_FOUND,
            DbError::UnknownTarget { .. } => StatusCode::NOT_FOUND,
            DbError::TransferTimeout => StatusCode::GATEWAY_TIMEOUT,
            DbError::SyntaxError { .. } => StatusCode::BAD_REQUEST,
            DbError::Engine { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DbError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            DbError::Protocol { .. } => StatusCode::BAD_REQUEST,
            DbError::NoSuchSession => StatusCode::NOT_FOUND,
            DbError::NoSuchStatement { .. } => StatusCode::NOT_FOUND,
            DbError::NoSuchRows { .. } => StatusCode::NOT_FOUND,
            DbError::ResultTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DbError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            DbError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same request (possibly elsewhere) can succeed
    /// without the client changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::NotLeader { .. }
                | DbError::Timeout
                | DbError::LeadershipLost
                | DbError::ChangeInProgress
                | DbError::NotReady
                | DbError::TransferTimeout
        )
    }

    /// Convert a SQLite error raised while compiling a statement.
    pub fn from_prepare(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if message.contains("syntax error") || message.contains("incomplete input") {
            DbError::SyntaxError { message }
        } else {
            DbError::Engine { message }
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Engine {
            message: err.to_string(),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code, see [`DbError::code`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Request identifier for log correlation.
    pub request_id: String,
    /// Redirect hint for `NotLeader`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<NodeInfo>,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let leader = match &self {
            DbError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        if let DbError::InternalError(err) = &self {
            tracing::error!("internal error: {err:#}");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            request_id: generate_request_id(),
            leader,
        };
        (status, axum::Json(body)).into_response()
    }
}
