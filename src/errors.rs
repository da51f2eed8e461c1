//! API error types.
//!
//! Every variant maps to one of the error kinds surfaced by the JSON API
//! as `{"error": {"code", "message", ...}}`.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(ApiError::NotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Error kinds shared by the storage backends, the upload state machine,
/// and the request dispatcher.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The referenced bucket, object, generation, or upload session does
    /// not exist.
    #[error("{0}")]
    NotFound(String),

    /// A bucket with this name already exists with different attributes.
    #[error("{0}")]
    AlreadyExists(String),

    /// The bucket still holds live objects.
    #[error("The bucket you tried to delete is not empty.")]
    NotEmpty,

    /// A generation or metageneration precondition did not hold, or an
    /// upload hash check failed at commit.
    #[error("{0}")]
    PreconditionFailed(String),

    /// A `Range` or resumable `Content-Range` header could not be
    /// satisfied against the current state.
    #[error("{0}")]
    RangeNotSatisfiable(String),

    /// Malformed request body, bad name, or bad query parameter.
    #[error("{0}")]
    Invalid(String),

    /// The selected backend does not support the requested feature.
    #[error("{0}")]
    NotSupported(String),

    /// Unexpected I/O or consistency failure.
    #[error("We encountered an internal error. Please try again.")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Reason tag included in the error envelope's `errors` list.
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "notFound",
            ApiError::AlreadyExists(_) => "conflict",
            ApiError::NotEmpty => "conflict",
            ApiError::PreconditionFailed(_) => "conditionNotMet",
            ApiError::RangeNotSatisfiable(_) => "requestedRangeNotSatisfiable",
            ApiError::Invalid(_) => "invalid",
            ApiError::NotSupported(_) => "notImplemented",
            ApiError::Internal(_) => "internalError",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::NotEmpty => StatusCode::CONFLICT,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log at the level the propagation policy assigns to each kind.
        match &self {
            ApiError::Internal(err) => error!("internal error: {err:#}"),
            ApiError::PreconditionFailed(msg) => warn!("precondition failed: {msg}"),
            other => debug!("request failed: {other}"),
        }

        let message = self.to_string();
        let body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "errors": [{
                    "message": message,
                    "domain": "global",
                    "reason": self.reason(),
                }],
            }
        });

        (status, Json(body)).into_response()
    }
}
