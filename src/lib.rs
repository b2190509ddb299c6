//! aeroguard - row-level policy enforcement for nested CRUD
//!
//! Every read is narrowed by a policy guard, every nested write is tagged
//! and verified inside one transaction, and every result is sanitized
//! before it leaves the service.

pub mod auth;
pub mod cli;
pub mod config;
pub mod core;
pub mod handler;
pub mod policy;
pub mod rest_api;
pub mod schema;
pub mod store;
