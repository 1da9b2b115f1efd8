//! API error type and its JSON rendering
//!
//! Every failure leaves the service as `{"error", "message", "details"?}`
//! with a status derived from where it came from: bad input is 400, a
//! missing upstream resource is 404, any other upstream failure is 502 and
//! local failures are 500.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::data::{CimaError, TableError};

/// API error type that converts to HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid request parameters (400)
    #[error("{message}")]
    BadRequest { message: String },

    /// Nothing found upstream (404)
    #[error("{message}")]
    NotFound {
        message: String,
        details: Option<Value>,
    },

    /// Upstream failed or answered with an error (502)
    #[error("{message}")]
    Upstream { message: String },

    /// Local failure (500)
    #[error("{message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>, details: Option<Value>) -> Self {
        Self::NotFound {
            message: message.into(),
            details,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<CimaError> for ApiError {
    fn from(e: CimaError) -> Self {
        match e {
            CimaError::MissingIdentifier(_) | CimaError::InvalidArgument(_) => {
                Self::bad_request(e.to_string())
            }
            e if e.is_not_found() => Self::not_found(e.to_string(), None),
            e => Self::Upstream {
                message: e.to_string(),
            },
        }
    }
}

impl From<TableError> for ApiError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::InvalidDate(_) => Self::bad_request(e.to_string()),
            e => Self::Internal {
                message: e.to_string(),
            },
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Internal { .. } | ApiError::Upstream { .. } => {
                tracing::error!(error = %self, status = status.as_u16(), "request failed");
            }
            _ => {
                tracing::warn!(error = %self, status = status.as_u16(), "request rejected");
            }
        }

        let error = self.error_code();
        let message = self.to_string();
        let details = match self {
            ApiError::NotFound { details, .. } => details,
            _ => None,
        };
        let body = ErrorResponse {
            error,
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
