//! # Auth Module
//!
//! Bearer-token validation producing the request principal, and argon2
//! hashing for `@password` fields.

pub mod crypto;
pub mod errors;
pub mod jwt;

pub use errors::{AuthError, AuthResult};
pub use jwt::{JwtClaims, JwtConfig, JwtManager};
