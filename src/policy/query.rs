//! # Guard Injection for Reads
//!
//! Rewrites find arguments so that every level of the result tree is
//! filtered by the read guard of its model. To-many relation fetches get
//! the guard inline in their nested `where`. To-one fetches cannot be
//! filtered by the store, so their id is force-selected and the check is
//! left to the sanitizer.

use serde_json::{Map, Value};
use tracing::debug;

use crate::core::{CoreError, CoreResult, PolicyOperation, QueryContext};
use crate::schema::{ModelDescriptor, Registry};

use super::guard;

/// Keys accepted in find arguments
const QUERY_KEYS: &[&str] = &["where", "select", "include", "orderBy", "skip", "take", "cursor", "distinct"];

/// Inject guards for `operation` into `args` and every nested relation
/// selection. `args` may be `null` (no arguments).
pub fn process_query_args(
    registry: &Registry,
    model: &ModelDescriptor,
    args: Value,
    operation: PolicyOperation,
    ctx: &QueryContext,
    inject_where: bool,
) -> CoreResult<Value> {
    let mut args = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(CoreError::invalid_params(format!(
                "query arguments for {} must be an object, found {}",
                model.name, other
            )))
        }
    };

    if args.contains_key("select") && args.contains_key("include") {
        return Err(CoreError::invalid_params(format!(
            "select and include cannot be used together on {}",
            model.name
        )));
    }
    if let Some(key) = args.keys().find(|k| !QUERY_KEYS.contains(&k.as_str())) {
        return Err(CoreError::invalid_params(format!(
            "unexpected query argument '{}' on {}",
            key, model.name
        )));
    }

    if inject_where {
        let guard = registry.guard(model, operation, ctx)?;
        let combined = match args.remove("where") {
            Some(Value::Null) | None => guard,
            Some(filter) => guard::and([guard, filter]),
        };
        debug!(model = %model.name, %operation, filter = %combined, "guard injected");
        args.insert("where".to_string(), combined);
    }

    for key in ["select", "include"] {
        let Some(selection) = args.get_mut(key) else {
            continue;
        };
        let Value::Object(selection) = selection else {
            return Err(CoreError::invalid_params(format!(
                "{} on {} must be an object",
                key, model.name
            )));
        };
        inject_selection(registry, model, selection, operation, ctx)?;
    }

    Ok(Value::Object(args))
}

fn inject_selection(
    registry: &Registry,
    model: &ModelDescriptor,
    selection: &mut Map<String, Value>,
    operation: PolicyOperation,
    ctx: &QueryContext,
) -> CoreResult<()> {
    for (name, value) in selection.iter_mut() {
        let Some(field) = registry.resolve_field(model, name) else {
            continue;
        };
        if !field.is_data_model || matches!(value, Value::Bool(false) | Value::Null) {
            continue;
        }

        let target = registry.require_target(field)?;
        let nested = match value.take() {
            Value::Bool(true) => Value::Null,
            other => other,
        };

        if field.is_to_many() {
            *value = process_query_args(registry, target, nested, operation, ctx, true)?;
            continue;
        }

        let mut nested = process_query_args(registry, target, nested, operation, ctx, false)?;
        if let Some(Value::Object(select)) = nested.get_mut("select") {
            select.insert(target.id_field.clone(), Value::Bool(true));
        }
        *value = match nested {
            Value::Object(map) if map.is_empty() => Value::Bool(true),
            other => other,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaLoader;
    use serde_json::json;

    fn registry() -> Registry {
        SchemaLoader::load_str(
            r#"{"models": [
                {"name": "User", "fields": [
                    {"name": "id", "type": "String"},
                    {"name": "posts", "type": "Post", "array": true, "relation": {"opposite": "author"}}
                ], "policies": {"allow": {"read": [{"id": {"$auth": "id"}}]}}},
                {"name": "Post", "fields": [
                    {"name": "id", "type": "String"},
                    {"name": "published", "type": "Boolean"},
                    {"name": "author", "type": "User", "optional": true, "relation": {"foreignKey": "authorId"}}
                ], "policies": {"allow": {"read": [{"published": true}]}}}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_guard_conjoined_with_where() {
        let registry = registry();
        let post = registry.model("Post").unwrap();
        let args = process_query_args(
            &registry,
            post,
            json!({"where": {"id": "p1"}}),
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        )
        .unwrap();

        assert_eq!(
            args,
            json!({"where": {"AND": [{"published": true}, {"id": "p1"}]}})
        );
    }

    #[test]
    fn test_guard_alone_without_where() {
        let registry = registry();
        let post = registry.model("Post").unwrap();
        let args = process_query_args(
            &registry,
            post,
            Value::Null,
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        )
        .unwrap();

        assert_eq!(args, json!({"where": {"published": true}}));
    }

    #[test]
    fn test_to_many_include_filtered_inline() {
        let registry = registry();
        let user = registry.model("User").unwrap();
        let args = process_query_args(
            &registry,
            user,
            json!({"include": {"posts": true}}),
            PolicyOperation::Read,
            &QueryContext::authenticated("u1"),
            true,
        )
        .unwrap();

        assert_eq!(args["where"], json!({"id": "u1"}));
        assert_eq!(args["include"]["posts"], json!({"where": {"published": true}}));
    }

    #[test]
    fn test_to_one_select_forces_id() {
        let registry = registry();
        let post = registry.model("Post").unwrap();
        let args = process_query_args(
            &registry,
            post,
            json!({"select": {"published": true, "author": {"select": {"id": false}}}}),
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        )
        .unwrap();

        assert_eq!(args["select"]["author"], json!({"select": {"id": true}}));
        assert!(args["select"]["author"].get("where").is_none());
    }

    #[test]
    fn test_to_one_include_left_for_sanitizer() {
        let registry = registry();
        let post = registry.model("Post").unwrap();
        let args = process_query_args(
            &registry,
            post,
            json!({"include": {"author": true}}),
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        )
        .unwrap();

        assert_eq!(args["include"]["author"], json!(true));
    }

    #[test]
    fn test_select_and_include_rejected() {
        let registry = registry();
        let user = registry.model("User").unwrap();
        let err = process_query_args(
            &registry,
            user,
            json!({"include": {"posts": true}, "select": {"id": true}}),
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        )
        .unwrap_err();

        assert_eq!(err.code(), "INVALID_REQUEST_PARAMS");
    }

    #[test]
    fn test_nested_select_and_include_rejected() {
        let registry = registry();
        let user = registry.model("User").unwrap();
        let result = process_query_args(
            &registry,
            user,
            json!({"include": {"posts": {"select": {"id": true}, "include": {"author": true}}}}),
            PolicyOperation::Read,
            &QueryContext::anonymous(),
            true,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_reapplying_nests_guard() {
        let registry = registry();
        let post = registry.model("Post").unwrap();
        let ctx = QueryContext::anonymous();
        let once = process_query_args(&registry, post, Value::Null, PolicyOperation::Read, &ctx, true).unwrap();
        let twice = process_query_args(&registry, post, once.clone(), PolicyOperation::Read, &ctx, true).unwrap();

        assert_eq!(
            twice["where"],
            json!({"AND": [{"published": true}, {"published": true}]})
        );
        assert_ne!(once, twice);
    }
}
