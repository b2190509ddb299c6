//! # REST API Module
//!
//! HTTP boundary over the policy handler: routing, principal extraction
//! and error rendering.

pub mod errors;
pub mod server;

pub use errors::{RestError, RestResult};
pub use server::{AppState, GuardServer};
