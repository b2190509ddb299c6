//! # Read Sanitizer
//!
//! Post-processes query results before they leave the handler:
//! - strips hidden fields (`@omit` and the transaction column)
//! - wraps non-JSON-native scalars as `{type, data}`
//! - re-checks every to-one relation against the target's guard and drops
//!   the ones that fail
//!
//! To-many items were already filtered by the store when the read guard
//! was injected, so they are only recursed into.
//!
//! The pass only removes or re-tags data; running it twice yields the same
//! output as running it once.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat};
use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::{CoreResult, PolicyOperation, QueryContext};
use crate::schema::{FieldInfo, ModelDescriptor, Registry, SpecialScalar};
use crate::store::Executor;

use super::guard;

/// Sanitize `data` (an entity, an array of entities or null) of `model` in
/// place. Returns true when at least one to-one relation was dropped.
pub fn post_process<'a, E>(
    registry: &'a Registry,
    exec: &'a E,
    model: &'a ModelDescriptor,
    data: &'a mut Value,
    operation: PolicyOperation,
    ctx: &'a QueryContext,
) -> BoxFuture<'a, CoreResult<bool>>
where
    E: Executor + ?Sized,
{
    async move {
        match data {
            Value::Array(items) => {
                let checks = items
                    .iter_mut()
                    .map(|item| post_process(registry, exec, model, item, operation, ctx));
                let flags = try_join_all(checks).await?;
                Ok(flags.into_iter().any(|sanitized| sanitized))
            }
            Value::Object(entity) => {
                sanitize_entity(registry, exec, model, entity, operation, ctx).await
            }
            _ => Ok(false),
        }
    }
    .boxed()
}

async fn sanitize_entity<E>(
    registry: &Registry,
    exec: &E,
    model: &ModelDescriptor,
    entity: &mut Map<String, Value>,
    operation: PolicyOperation,
    ctx: &QueryContext,
) -> CoreResult<bool>
where
    E: Executor + ?Sized,
{
    for field in model.fields.iter().filter(|f| f.is_hidden()) {
        entity.remove(&field.name);
    }
    for field in model.scalars() {
        if let (Some(kind), Some(value)) = (field.special_scalar(), entity.get_mut(&field.name)) {
            wrap_scalar(kind, value);
        }
    }

    let mut sanitized = false;

    // to-one relations present in the result
    let to_one: Vec<&FieldInfo> = model
        .relations()
        .filter(|f| f.is_to_one() && entity.get(&f.name).is_some_and(Value::is_object))
        .collect();
    let checks = to_one
        .iter()
        .map(|field| check_to_one(registry, exec, field, &entity[field.name.as_str()], operation, ctx));
    let verdicts = try_join_all(checks).await?;

    for (field, readable) in to_one.iter().zip(verdicts) {
        if !readable {
            debug!(model = %model.name, field = %field.name, %operation, "to-one relation trimmed");
            entity.remove(&field.name);
            sanitized = true;
        }
    }

    let nested = entity.iter_mut().filter_map(|(name, value)| {
        let field = model.field(name).filter(|f| f.is_data_model)?;
        let target = registry.target(field)?;
        Some(post_process(registry, exec, target, value, operation, ctx))
    });
    let flags = try_join_all(nested).await?;

    Ok(sanitized || flags.into_iter().any(|f| f))
}

/// Whether a fetched to-one entity passes its model's guard
async fn check_to_one<E>(
    registry: &Registry,
    exec: &E,
    field: &FieldInfo,
    value: &Value,
    operation: PolicyOperation,
    ctx: &QueryContext,
) -> CoreResult<bool>
where
    E: Executor + ?Sized,
{
    let target = registry.require_target(field)?;
    let Some(id) = value.get(&target.id_field).cloned() else {
        return Ok(false);
    };
    // a wrapped id means an earlier pass already kept this relation
    if is_tagged(&id) {
        return Ok(true);
    }

    let guard = registry.guard(target, operation, ctx)?;
    if guard::is_true(&guard) {
        return Ok(true);
    }
    if guard::is_false(&guard) {
        return Ok(false);
    }

    let mut by_id = Map::new();
    by_id.insert(target.id_field.clone(), id);
    let filter = guard::and([Value::Object(by_id), guard]);
    let count = exec.count(target.id, json!({ "where": filter })).await?;
    Ok(count > 0)
}

/// `{type, data}` wrapper produced by `wrap_scalar`
pub fn is_tagged(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            obj.len() == 2
                && obj.get("type").and_then(Value::as_str).and_then(SpecialScalar::from_type_name).is_some()
                && obj.contains_key("data")
        }
        None => false,
    }
}

/// Wrap a stored scalar for transport. Null and already-wrapped values are
/// left alone.
pub fn wrap_scalar(kind: SpecialScalar, value: &mut Value) {
    if value.is_null() || is_tagged(value) {
        return;
    }

    let data = match (kind, &*value) {
        (SpecialScalar::DateTime, Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(stamp) => stamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            Err(_) => s.clone(),
        },
        (SpecialScalar::Bytes, Value::Array(items)) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            match bytes {
                Some(bytes) => STANDARD.encode(bytes),
                None => value.to_string(),
            }
        }
        (_, Value::String(s)) => s.clone(),
        (_, other) => other.to_string(),
    };

    *value = json!({ "type": kind.as_str(), "data": data });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaLoader;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn setup() -> (Arc<Registry>, InMemoryStore) {
        let registry = Arc::new(
            SchemaLoader::load_str(
                r#"{"models": [
                    {"name": "Parent", "fields": [
                        {"name": "id", "type": "String"},
                        {"name": "secret", "type": "String", "optional": true, "attributes": ["omit"]},
                        {"name": "born", "type": "DateTime", "optional": true},
                        {"name": "child", "type": "Child", "optional": true, "relation": {"foreignKey": "childId"}},
                        {"name": "tag", "type": "Tag", "optional": true, "relation": {"foreignKey": "tagId"}}
                    ], "policies": {"allow": {"all": [{}]}}},
                    {"name": "Tag", "fields": [
                        {"name": "id", "type": "BigInt", "attributes": ["id"]},
                        {"name": "value", "type": "Int"}
                    ], "policies": {"allow": {"all": [{}]}, "deny": {"read": [{"value": 200}]}}},
                    {"name": "Child", "fields": [
                        {"name": "id", "type": "String"},
                        {"name": "value", "type": "Int"},
                        {"name": "size", "type": "BigInt", "optional": true}
                    ], "policies": {"allow": {"all": [{}]}, "deny": {"read": [{"value": 200}]}}}
                ]}"#,
            )
            .unwrap(),
        );
        let store = InMemoryStore::new(registry.clone());
        (registry, store)
    }

    #[tokio::test]
    async fn test_hidden_fields_stripped_and_scalars_wrapped() {
        let (registry, store) = setup();
        let parent = registry.model("Parent").unwrap();
        let mut data = json!({
            "id": "p1",
            "secret": "s",
            "__txTag": "tx:create",
            "born": "2024-01-02T03:04:05Z"
        });

        let sanitized = post_process(
            registry.as_ref(),
            &store,
            parent,
            &mut data,
            PolicyOperation::Read,
            &QueryContext::anonymous(),
        )
        .await
        .unwrap();

        assert!(!sanitized);
        assert!(data.get("secret").is_none());
        assert!(data.get("__txTag").is_none());
        assert_eq!(
            data["born"],
            json!({"type": "DateTime", "data": "2024-01-02T03:04:05.000Z"})
        );
    }

    #[tokio::test]
    async fn test_unreadable_to_one_trimmed() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Child": [{"id": "c1", "value": 200}, {"id": "c2", "value": 1, "size": 7}]}))
            .await
            .unwrap();
        let parent = registry.model("Parent").unwrap();
        let mut data = json!([
            {"id": "p1", "child": {"id": "c1", "value": 200}},
            {"id": "p2", "child": {"id": "c2", "value": 1, "size": 7}}
        ]);

        let sanitized = post_process(
            registry.as_ref(),
            &store,
            parent,
            &mut data,
            PolicyOperation::Read,
            &QueryContext::anonymous(),
        )
        .await
        .unwrap();

        assert!(sanitized);
        assert!(data[0].get("child").is_none());
        assert_eq!(data[1]["child"]["size"], json!({"type": "BigInt", "data": "7"}));
    }

    #[tokio::test]
    async fn test_post_process_idempotent() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Child": [{"id": "c1", "value": 200}, {"id": "c2", "value": 1}]}))
            .await
            .unwrap();
        let parent = registry.model("Parent").unwrap();
        let ctx = QueryContext::anonymous();
        let mut data = json!([
            {"id": "p1", "born": "2024-01-02T03:04:05Z", "child": {"id": "c1", "value": 200}},
            {"id": "p2", "child": {"id": "c2", "value": 1, "size": 9}}
        ]);

        post_process(registry.as_ref(), &store, parent, &mut data, PolicyOperation::Read, &ctx)
            .await
            .unwrap();
        let once = data.clone();
        let again = post_process(registry.as_ref(), &store, parent, &mut data, PolicyOperation::Read, &ctx)
            .await
            .unwrap();

        assert!(!again);
        assert_eq!(data, once);
    }

    #[tokio::test]
    async fn test_wrapped_to_one_id_kept_on_second_pass() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Tag": [{"id": 7, "value": 1}]}))
            .await
            .unwrap();
        let parent = registry.model("Parent").unwrap();
        let ctx = QueryContext::anonymous();
        let mut data = json!({"id": "p1", "tag": {"id": 7, "value": 1}});

        let first = post_process(registry.as_ref(), &store, parent, &mut data, PolicyOperation::Read, &ctx)
            .await
            .unwrap();
        assert!(!first);
        assert_eq!(data["tag"]["id"], json!({"type": "BigInt", "data": "7"}));

        let once = data.clone();
        let second = post_process(registry.as_ref(), &store, parent, &mut data, PolicyOperation::Read, &ctx)
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(data, once);
    }

    #[test]
    fn test_wrap_bytes_out_of_range_not_truncated() {
        let mut value = json!([104, 300]);
        wrap_scalar(SpecialScalar::Bytes, &mut value);
        assert_eq!(value, json!({"type": "Bytes", "data": "[104,300]"}));
    }

    #[test]
    fn test_wrap_bytes_from_array() {
        let mut value = json!([104, 105]);
        wrap_scalar(SpecialScalar::Bytes, &mut value);
        assert_eq!(value, json!({"type": "Bytes", "data": "aGk="}));
    }
}
