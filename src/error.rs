use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Unified error type for the scheduler core.
///
/// Store errors propagate straight to the caller; task-input validation rejects
/// at ingress; everything else the Executor/Scheduler encounters is swallowed
/// into Run/log state before it ever reaches this type.
#[derive(Debug, thiserror::Error)]
pub enum AgentSchedError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl AgentSchedError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidTask(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Io(_) | Self::Scheduler(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AgentSchedError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AgentSchedError>;
