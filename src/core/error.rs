//! Core Error Types
//!
//! Unified error taxonomy for policy enforcement. Every failure surfaced at
//! the boundary carries one of the codes below.

use thiserror::Error;

use crate::store::StoreError;

/// Core module result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed or missing request input
    #[error("Invalid request parameters: {0}")]
    InvalidRequestParams(String),

    /// A targeted single-entity read had no match
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Access denied by policy
    #[error("Denied by policy: {0}")]
    DeniedByPolicy(String),

    #[error("Unique constraint violation: {0}")]
    UniqueConstraintViolation(String),

    #[error("Reference constraint violation: {0}")]
    ReferenceConstraintViolation(String),

    /// The write succeeded but its result may not be read back
    #[error("Result is not allowed to be read back: {0}")]
    ReadBackAfterWriteDenied(String),

    /// Unmapped store error, tagged with the provider's code
    #[error("Store error [{provider_code}]: {message}")]
    Store {
        provider_code: String,
        message: String,
    },

    /// Internal error (detail is never sent to the caller)
    #[error("Internal error: {0}")]
    Unknown(String),
}

impl CoreError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidRequestParams(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::EntityNotFound(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::DeniedByPolicy(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Get error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequestParams(_) => "INVALID_REQUEST_PARAMS",
            Self::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            Self::DeniedByPolicy(_) => "DENIED_BY_POLICY",
            Self::UniqueConstraintViolation(_) => "UNIQUE_CONSTRAINT_VIOLATION",
            Self::ReferenceConstraintViolation(_) => "REFERENCE_CONSTRAINT_VIOLATION",
            Self::ReadBackAfterWriteDenied(_) => "READ_BACK_AFTER_WRITE_DENIED",
            Self::Store { .. } | Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequestParams(_) => 400,
            Self::UniqueConstraintViolation(_) => 400,
            Self::ReferenceConstraintViolation(_) => 400,
            Self::Store { .. } => 400,
            Self::DeniedByPolicy(_) => 403,
            Self::ReadBackAfterWriteDenied(_) => 403,
            Self::EntityNotFound(_) => 404,
            Self::Unknown(_) => 500,
        }
    }

    /// Message safe to send to the caller
    pub fn public_message(&self) -> String {
        match self {
            Self::Unknown(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Provider code for unmapped store errors
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Store { provider_code, .. } => Some(provider_code),
            _ => None,
        }
    }

    pub fn is_policy_denial(&self) -> bool {
        matches!(self, Self::DeniedByPolicy(_) | Self::ReadBackAfterWriteDenied(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(msg) => Self::UniqueConstraintViolation(msg),
            StoreError::ForeignKeyViolation(msg) => Self::ReferenceConstraintViolation(msg),
            StoreError::RecordNotFound(msg) => Self::EntityNotFound(msg),
            StoreError::InvalidArgs(msg) => Self::InvalidRequestParams(msg),
            StoreError::Provider { code, message } => Self::Store {
                provider_code: code,
                message,
            },
            StoreError::Internal(msg) => Self::Unknown(msg),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidRequestParams(e.to_string())
    }
}
