//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cbuild_scheduler::SchedulerError;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<cbuild_core::Error> for ApiError {
    fn from(err: cbuild_core::Error) -> Self {
        match err {
            cbuild_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            cbuild_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            cbuild_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match &err {
            SchedulerError::Setup(_)
            | SchedulerError::ManifestNotFound(_)
            | SchedulerError::InvalidCommit(_) => ApiError::BadRequest(err.to_string()),
            SchedulerError::LockHeld { .. }
            | SchedulerError::NotRunning(_)
            | SchedulerError::AlreadyStopping(_)
            | SchedulerError::ExecutionIdExhausted(_) => ApiError::Conflict(err.to_string()),
            SchedulerError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SchedulerError::LockLost { .. }
            | SchedulerError::Persist(_)
            | SchedulerError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbuild_core::id::{LockId, TraceId};

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_scheduler_error_status_codes() {
        let repo = "github.com/acme/widgets".parse().unwrap();
        assert_eq!(
            status(SchedulerError::ManifestNotFound("cbuild.kdl".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SchedulerError::LockHeld {
                lock_id: LockId::for_commit(&repo, "abc123"),
                owner: TraceId::new(),
                stale_after_secs: 900,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(SchedulerError::NotFound("execution abc123/0001".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SchedulerError::Store(cbuild_core::Error::Unavailable(
                "db".to_string()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_core_error_status_codes() {
        assert_eq!(
            status(cbuild_core::Error::InvalidInput("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(cbuild_core::Error::Unavailable("down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
