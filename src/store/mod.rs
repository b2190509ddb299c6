//! # Data Access Layer
//!
//! Async store boundary consumed by the policy handler. Arguments and
//! results are JSON values in the familiar `where` / `select` / `include` /
//! `data` shape. Writes may nest relation operations.
//!
//! A `Transaction` is an `Executor` whose effects become visible to others
//! only after `commit`. Dropping it without committing discards them.

mod filter;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::schema::ModelId;

pub use memory::InMemoryStore;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error type
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Unique constraint failed on {0}")]
    UniqueViolation(String),

    #[error("Foreign key constraint failed on {0}")]
    ForeignKeyViolation(String),

    /// A write targeted a record that does not exist
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Provider-specific failure
    #[error("{code}: {message}")]
    Provider { code: String, message: String },

    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgs(msg.into())
    }
}

/// Per-model data operations
#[async_trait]
pub trait Executor: Send + Sync {
    async fn find_many(&self, model: ModelId, args: Value) -> StoreResult<Vec<Value>>;

    async fn find_first(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>>;

    /// Like `find_first`, but `where` must be present
    async fn find_unique(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>>;

    async fn create(&self, model: ModelId, args: Value) -> StoreResult<Value>;

    async fn update(&self, model: ModelId, args: Value) -> StoreResult<Value>;

    /// Returns the number of updated rows
    async fn update_many(&self, model: ModelId, args: Value) -> StoreResult<u64>;

    async fn delete(&self, model: ModelId, args: Value) -> StoreResult<Value>;

    /// Returns the number of deleted rows
    async fn delete_many(&self, model: ModelId, args: Value) -> StoreResult<u64>;

    async fn count(&self, model: ModelId, args: Value) -> StoreResult<u64>;
}

/// An open interactive transaction
#[async_trait]
pub trait Transaction: Executor {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// A store that can open transactions
#[async_trait]
pub trait DataStore: Executor {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}
