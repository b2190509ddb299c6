//! # Auth Errors
//!
//! Error types for the authentication helpers.

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    // ==================
    // JWT Errors
    // ==================

    /// Authorization header is present but not `Bearer <token>`
    #[error("Malformed authorization header")]
    MalformedHeader,

    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    // ==================
    // Internal Errors
    // ==================

    /// Password hashing failed
    #[error("Internal error: password hashing failed")]
    HashingFailed,

    /// Stored hash could not be parsed
    #[error("Invalid password hash")]
    InvalidHash,

    /// Token generation failed
    #[error("Internal error: token generation failed")]
    TokenGenerationFailed,
}

impl AuthError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::MalformedHeader => 400,
            AuthError::MalformedToken => 401,
            AuthError::TokenExpired => 401,
            AuthError::InvalidSignature => 401,

            AuthError::HashingFailed => 500,
            AuthError::InvalidHash => 500,
            AuthError::TokenGenerationFailed => 500,
        }
    }

    /// Stable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MalformedHeader | AuthError::MalformedToken => "INVALID_TOKEN",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::InvalidSignature => "INVALID_TOKEN",
            _ => "UNKNOWN",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}
