//! # Schema Module
//!
//! Model and field metadata consumed by the enforcement pipeline, the
//! registry that interns it, and the loader for the JSON schema document.

mod errors;
mod loader;
mod registry;
mod types;

pub use errors::{SchemaError, SchemaResult};
pub use loader::{ModelDocument, SchemaDocument, SchemaLoader};
pub use registry::Registry;
pub use types::{
    FieldAttribute, FieldInfo, ModelDescriptor, ModelId, RelationInfo, SpecialScalar,
    TRANSACTION_FIELD,
};
