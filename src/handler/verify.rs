//! Post-write verification
//!
//! Every row a write touched carries `<txId>:<operation>` in the
//! transaction column. For each included model and write operation the
//! tagged rows are counted twice, unfiltered and with the operation's guard.
//! Any difference means a tagged row fails its policy. All counts are
//! gathered before anything is decided; deferred deletes and tag clearing
//! only run once every count has matched.

use std::collections::BTreeSet;

use futures_util::future::try_join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::core::{CoreError, CoreResult, PolicyOperation, QueryContext};
use crate::policy::guard;
use crate::policy::transaction_tag;
use crate::schema::{ModelDescriptor, ModelId, Registry, TRANSACTION_FIELD};
use crate::store::Executor;

/// Tagged-row counts for one model and operation
#[derive(Debug, Clone)]
struct TagCount<'r> {
    model: &'r ModelDescriptor,
    operation: PolicyOperation,
    full: u64,
    filtered: u64,
}

fn tag_filter(tx_id: &str, operation: PolicyOperation) -> Value {
    let mut filter = Map::new();
    filter.insert(
        TRANSACTION_FIELD.to_string(),
        Value::String(transaction_tag(tx_id, operation)),
    );
    Value::Object(filter)
}

async fn count_tagged<'r, E>(
    registry: &'r Registry,
    exec: &E,
    model: &'r ModelDescriptor,
    operation: PolicyOperation,
    tx_id: &str,
    ctx: &QueryContext,
) -> CoreResult<TagCount<'r>>
where
    E: Executor + ?Sized,
{
    let filter = tag_filter(tx_id, operation);
    let full = exec.count(model.id, json!({ "where": filter.clone() })).await?;

    let filtered = if full == 0 {
        0
    } else {
        let guard = registry.guard(model, operation, ctx)?;
        if guard::is_true(&guard) {
            full
        } else {
            let filter = guard::and([filter, guard]);
            exec.count(model.id, json!({ "where": filter })).await?
        }
    };

    Ok(TagCount {
        model,
        operation,
        full,
        filtered,
    })
}

/// Prove every tagged row of `included` satisfies its operation's policy,
/// then perform the deferred deletes and clear the remaining tags
pub(super) async fn verify_writes<E>(
    registry: &Registry,
    exec: &E,
    included: &BTreeSet<ModelId>,
    tx_id: &str,
    ctx: &QueryContext,
) -> CoreResult<()>
where
    E: Executor + ?Sized,
{
    let checks = included.iter().flat_map(move |id| {
        let model = registry.get(*id);
        PolicyOperation::WRITES
            .into_iter()
            .map(move |operation| count_tagged(registry, exec, model, operation, tx_id, ctx))
    });
    let counts = try_join_all(checks).await?;

    if let Some(failed) = counts.iter().find(|c| c.full != c.filtered) {
        warn!(
            model = %failed.model.name,
            operation = %failed.operation,
            full = failed.full,
            filtered = failed.filtered,
            "post-write verification failed"
        );
        return Err(CoreError::denied(format!(
            "{} {} of {} entities violate policy",
            failed.full - failed.filtered,
            failed.operation,
            failed.model.name
        )));
    }

    for count in counts.iter().filter(|c| c.full > 0) {
        let filter = tag_filter(tx_id, count.operation);
        let affected = match count.operation {
            PolicyOperation::Delete => {
                exec.delete_many(count.model.id, json!({ "where": filter }))
                    .await?
            }
            _ => {
                let mut clear = Map::new();
                clear.insert(TRANSACTION_FIELD.to_string(), Value::Null);
                exec.update_many(
                    count.model.id,
                    json!({ "where": filter, "data": clear }),
                )
                .await?
            }
        };
        debug!(
            model = %count.model.name,
            operation = %count.operation,
            affected,
            "tagged rows settled"
        );
    }
    Ok(())
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
                    {"name": "Item", "fields": [
                        {"name": "id", "type": "String"},
                        {"name": "value", "type": "Int"}
                    ], "policies": {"allow": {
                        "read": [{}],
                        "create": [{"value": {"gt": 0}}],
                        "update": [{}],
                        "delete": [{"value": {"lt": 100}}]
                    }}}
                ]}"#,
            )
            .unwrap(),
        );
        let store = InMemoryStore::new(registry.clone());
        (registry, store)
    }

    #[tokio::test]
    async fn test_matching_counts_clear_tags() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Item": [{"id": "a", "value": 1, "__txTag": "t1:create"}]}))
            .await
            .unwrap();
        let item = registry.model("Item").unwrap();

        verify_writes(
            registry.as_ref(),
            &store,
            &BTreeSet::from([item.id]),
            "t1",
            &QueryContext::anonymous(),
        )
        .await
        .unwrap();

        let row = store.find_first(item.id, Value::Null).await.unwrap().unwrap();
        assert_eq!(row["__txTag"], Value::Null);
    }

    #[tokio::test]
    async fn test_mismatched_counts_denied() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Item": [
                {"id": "a", "value": 0, "__txTag": "t1:create"},
                {"id": "b", "value": 1, "__txTag": "t1:create"}
            ]}))
            .await
            .unwrap();
        let item = registry.model("Item").unwrap();

        let err = verify_writes(
            registry.as_ref(),
            &store,
            &BTreeSet::from([item.id]),
            "t1",
            &QueryContext::anonymous(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "DENIED_BY_POLICY");
    }

    #[tokio::test]
    async fn test_deferred_delete_applied() {
        let (registry, store) = setup();
        store
            .seed(&json!({"Item": [
                {"id": "a", "value": 5, "__txTag": "t1:delete"},
                {"id": "b", "value": 6, "__txTag": "t2:delete"}
            ]}))
            .await
            .unwrap();
        let item = registry.model("Item").unwrap();

        verify_writes(
            registry.as_ref(),
            &store,
            &BTreeSet::from([item.id]),
            "t1",
            &QueryContext::anonymous(),
        )
        .await
        .unwrap();

        let remaining = store.find_many(item.id, Value::Null).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["id"], json!("b"));
    }
}
