//! # REST API Errors
//!
//! Maps enforcement and auth failures onto HTTP responses with the body
//! `{ "error": { "code", "message", "providerCode"? } }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::core::CoreError;

/// Result type for REST operations
pub type RestResult<T> = Result<T, RestError>;

/// REST API errors
#[derive(Debug, Clone, Error)]
pub enum RestError {
    // ==================
    // Client Errors (4xx)
    // ==================
    /// Invalid query parameter
    #[error("Invalid query parameter: {0}")]
    InvalidQueryParam(String),

    /// Invalid request body
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    // ==================
    // Auth Errors
    // ==================
    #[error("{0}")]
    Auth(#[from] AuthError),

    // ==================
    // Enforcement Errors
    // ==================
    #[error("{0}")]
    Core(#[from] CoreError),
}

impl RestError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        let code = match self {
            RestError::InvalidQueryParam(_) | RestError::InvalidBody(_) => 400,
            RestError::Auth(err) => err.status_code(),
            RestError::Core(err) => err.status_code(),
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn code(&self) -> &'static str {
        match self {
            RestError::InvalidQueryParam(_) | RestError::InvalidBody(_) => "INVALID_REQUEST_PARAMS",
            RestError::Auth(err) => err.code(),
            RestError::Core(err) => err.code(),
        }
    }

    fn public_message(&self) -> String {
        match self {
            RestError::Core(err) => err.public_message(),
            RestError::Auth(err) if !err.is_client_error() => {
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
}

impl From<RestError> for ErrorResponse {
    fn from(err: RestError) -> Self {
        let provider_code = match &err {
            RestError::Core(core) => core.provider_code().map(str::to_string),
            _ => None,
        };
        Self {
            error: ErrorBody {
                code: err.code(),
                message: err.public_message(),
                provider_code,
            },
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse::from(self));
        (status, body).into_response()
    }
}
