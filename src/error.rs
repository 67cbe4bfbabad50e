//! Errors returned by the HTTP API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

use crate::memory::{SessionError, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{error}")]
    BadRequest {
        error: String,
        detail: Option<String>,
        debug: Option<Value>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("memory store unavailable")]
    MemoryDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        ApiError::BadRequest {
            error: error.into(),
            detail: None,
            debug: None,
        }
    }

    /// A required field is absent from a request body.
    pub fn missing_field(field: &str) -> Self {
        Self::bad_request(format!("Missing required field: {}", field))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MemoryDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) | SessionError::ResultNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            other => ApiError::Unprocessable(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = match self {
            ApiError::BadRequest {
                error,
                detail,
                debug,
            } => {
                let mut body = json!({ "error": error, "detail": detail });
                if let Some(debug) = debug {
                    body["debug"] = debug;
                }
                body
            }
            ApiError::Store(e) => json!({ "error": "Memory store error", "detail": e.to_string() }),
            other => json!({ "error": other.to_string(), "detail": Value::Null }),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
