//! # Policy Enforcement
//!
//! Guard construction and the request-shaping passes built on it:
//! nested-write traversal, read guard injection, write preparation and
//! result sanitization.

pub mod guard;
pub mod query;
pub mod sanitize;
pub mod visitor;
pub mod write;

pub use guard::{AllowAll, Guard, GuardProvider, PolicyRules, RuleGuardProvider};
pub use query::process_query_args;
pub use sanitize::post_process;
pub use visitor::{NestedWriteVisitor, WriteAction, WriteNode, WriteVisitor};
pub use write::{pre_write_guard_args, prepare_write, transaction_tag, PreparedWrite};
