//! # AeroGuard Core Module
//!
//! Request-scoped value types shared by every enforcement stage: the query
//! context, the policy operation axis and the error taxonomy.

pub mod context;
pub mod error;
pub mod operation;

pub use context::{AuthUser, QueryContext};
pub use error::{CoreError, CoreResult};
pub use operation::{HttpMethod, PolicyOperation};
