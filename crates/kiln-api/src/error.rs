//! Error types for the kiln API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::{ApiVersion, BuildError};
use thiserror::Error;

/// The transport refused to lift half-duplex behavior.
///
/// Never fatal: the build proceeds with progress held back until the
/// upload is complete.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("full duplex is not supported by this transport")]
    NotSupported,

    #[error("response already committed")]
    AlreadyCommitted,
}

/// The request is malformed. Reported before any streaming begins.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported media type {0:?}, expected application/x-tar")]
    UnsupportedMediaType(String),

    #[error("invalid API version: {0:?}")]
    InvalidVersion(String),

    #[error("client version {requested} is too old. Minimum supported API version is {minimum}")]
    VersionTooOld {
        requested: ApiVersion,
        minimum: ApiVersion,
    },

    #[error("client version {requested} is too new. Maximum supported API version is {maximum}")]
    VersionTooNew {
        requested: ApiVersion,
        maximum: ApiVersion,
    },

    #[error("invalid query string: {0}")]
    Query(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
}

impl DecodeError {
    pub fn status(&self) -> StatusCode {
        match self {
            DecodeError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors returned by [`Orchestrator::handle`](crate::Orchestrator::handle).
///
/// Build failures are not here: they are written to the stream as an
/// error frame and the handler returns `Ok`.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to write build result: {0}")]
    Write(std::io::Error),
}

/// A status-coded JSON error response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self {
        ApiError::new(e.status(), e.to_string())
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        let status = match &e {
            BuildError::InvalidArgument(_)
            | BuildError::InvalidContext(_)
            | BuildError::MissingContext => StatusCode::BAD_REQUEST,
            BuildError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "success": false,
                "error": self.message,
            })),
        )
            .into_response()
    }
}
