//! Model Registry
//!
//! Interned model descriptors plus the installed guard provider. Built once
//! at service start, then shared read-only (behind an `Arc`) by every
//! request handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{CoreError, CoreResult, PolicyOperation, QueryContext};
use crate::policy::guard::{Guard, GuardProvider};

use super::types::{FieldInfo, ModelDescriptor, ModelId};

pub struct Registry {
    models: Vec<ModelDescriptor>,
    by_name: HashMap<String, ModelId>,
    guards: Arc<dyn GuardProvider>,
}

impl Registry {
    /// Build a registry. Model ids are assigned from table position.
    pub fn new(mut models: Vec<ModelDescriptor>, guards: Arc<dyn GuardProvider>) -> Self {
        let mut by_name = HashMap::with_capacity(models.len());
        for (idx, model) in models.iter_mut().enumerate() {
            model.id = ModelId(idx);
            by_name.insert(model.name.clone(), model.id);
        }
        Self {
            models,
            by_name,
            guards,
        }
    }

    /// Replace the guard provider
    pub fn with_guard_provider(mut self, guards: Arc<dyn GuardProvider>) -> Self {
        self.guards = guards;
        self
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter()
    }

    pub fn get(&self, id: ModelId) -> &ModelDescriptor {
        &self.models[id.0]
    }

    /// Look up a model by name
    pub fn model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.by_name.get(name).map(|id| self.get(*id))
    }

    /// Look up a model by name, rejecting unknown names as bad input
    pub fn require_model(&self, name: &str) -> CoreResult<&ModelDescriptor> {
        self.model(name)
            .ok_or_else(|| CoreError::invalid_params(format!("unknown model: {}", name)))
    }

    pub fn resolve_field<'a>(&'a self, model: &'a ModelDescriptor, field: &str) -> Option<&'a FieldInfo> {
        model.field(field)
    }

    /// Target model of a relation field
    pub fn target(&self, field: &FieldInfo) -> Option<&ModelDescriptor> {
        if !field.is_data_model {
            return None;
        }
        self.model(&field.type_name)
    }

    pub fn require_target(&self, field: &FieldInfo) -> CoreResult<&ModelDescriptor> {
        self.target(field).ok_or_else(|| {
            CoreError::invalid_params(format!("field {} is not a relation", field.name))
        })
    }

    /// Guard for `(model, operation, context)` from the installed provider
    pub fn guard(
        &self,
        model: &ModelDescriptor,
        operation: PolicyOperation,
        ctx: &QueryContext,
    ) -> CoreResult<Guard> {
        self.guards.build_guard(model, operation, ctx)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::guard::AllowAll;
    use crate::schema::types::FieldInfo;

    fn model(name: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: ModelId(usize::MAX),
            name: name.to_string(),
            id_field: "id".to_string(),
            fields: vec![FieldInfo::scalar("id", "String")],
        }
    }

    #[test]
    fn test_ids_follow_table_position() {
        let registry = Registry::new(vec![model("User"), model("Post")], Arc::new(AllowAll));

        let post = registry.model("Post").unwrap();
        assert_eq!(post.id, ModelId(1));
        assert_eq!(registry.get(post.id).name, "Post");
    }

    #[test]
    fn test_unknown_model_is_invalid_request() {
        let registry = Registry::new(vec![model("User")], Arc::new(AllowAll));

        let err = registry.require_model("Nope").unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST_PARAMS");
    }

    #[test]
    fn test_scalar_has_no_target() {
        let registry = Registry::new(vec![model("User")], Arc::new(AllowAll));
        let user = registry.model("User").unwrap();
        let id = registry.resolve_field(user, "id").unwrap();

        assert!(registry.target(id).is_none());
        assert!(registry.resolve_field(user, "missing").is_none());
    }
}
