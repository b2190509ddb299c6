//! Query Context
//!
//! The authenticated principal for the current request. Created once per
//! request, immutable afterwards, and passed to every guard and check call.

use std::time::Instant;

use serde_json::{Map, Value};
use uuid::Uuid;

/// Context carried through policy enforcement for one request
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Request ID for tracing
    pub request_id: Uuid,

    /// The authenticated principal (None if anonymous)
    pub user: Option<AuthUser>,

    /// Start time for duration tracking
    started_at: Instant,
}

impl QueryContext {
    /// Create a context for the given principal
    pub fn new(user: Option<AuthUser>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user,
            started_at: Instant::now(),
        }
    }

    /// Create an anonymous context
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Create a context for an authenticated user without extra claims
    pub fn authenticated(id: impl Into<String>) -> Self {
        Self::new(Some(AuthUser::new(id)))
    }

    /// Get the principal's id, if any
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Look up a principal claim. `id` resolves to the principal id.
    pub fn claim(&self, name: &str) -> Option<Value> {
        let user = self.user.as_ref()?;
        if name == "id" {
            return Some(Value::String(user.id.clone()));
        }
        user.claims.get(name).cloned()
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Authenticated principal
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    /// Principal id
    pub id: String,

    /// Additional claims (from the bearer token)
    pub claims: Map<String, Value>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    /// Attach a claim
    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }
}
