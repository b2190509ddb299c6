//! # Policy Handler
//!
//! Entry point for one CRUD request. Maps the HTTP verb to a policy
//! operation and runs its state machine:
//!
//! - read: inject the read guard, fetch, sanitize
//! - create: tag, write, verify, read back, all in one transaction
//! - update: pre-write guard check outside the transaction, then as create
//! - delete: guarded existence check, delete and sanitize in one transaction
//!
//! Any error inside a transaction rolls the whole request back.

mod verify;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::core::{CoreError, CoreResult, HttpMethod, PolicyOperation, QueryContext};
use crate::policy::{post_process, pre_write_guard_args, prepare_write, process_query_args};
use crate::schema::{ModelDescriptor, Registry};
use crate::store::{DataStore, Executor, Transaction};

/// Status and JSON body for the boundary
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: Value,
}

impl HandlerResponse {
    fn new(status: u16, data: Value) -> Self {
        Self {
            status,
            body: json!({ "data": data }),
        }
    }
}

/// Transactional CRUD orchestrator
#[derive(Clone)]
pub struct PolicyHandler {
    registry: Arc<Registry>,
    store: Arc<dyn DataStore>,
}

impl PolicyHandler {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn DataStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one request. `args` is the query arguments for GET and the
    /// `{data, select?, include?}` body for POST and PUT.
    pub async fn handle(
        &self,
        method: HttpMethod,
        model: &str,
        id: Option<&str>,
        args: Option<Value>,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let span = info_span!(
            "policy_request",
            request_id = %ctx.request_id,
            model,
            method = method.as_str()
        );

        async move {
            let result = self.dispatch(method, model, id, args, ctx).await;
            match &result {
                Ok(response) => {
                    let elapsed_ms = ctx.elapsed_ms() as u64;
                    info!(status = response.status, elapsed_ms, "request handled")
                }
                Err(CoreError::Unknown(detail)) => error!(detail = %detail, "request failed"),
                Err(err) if err.is_policy_denial() => warn!(code = err.code(), "request denied"),
                Err(err) => debug!(code = err.code(), error = %err, "request rejected"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        method: HttpMethod,
        model: &str,
        id: Option<&str>,
        args: Option<Value>,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let model = self.registry.require_model(model)?;
        let args = args.unwrap_or(Value::Null);

        match (method, id) {
            (HttpMethod::Get, None) => self.find_many(model, args, ctx).await,
            (HttpMethod::Get, Some(id)) => self.find_one(model, id, args, ctx).await,
            (HttpMethod::Post, _) => self.create(model, args, ctx).await,
            (HttpMethod::Put, Some(id)) => self.update(model, id, args, ctx).await,
            (HttpMethod::Delete, Some(id)) => self.delete(model, id, args, ctx).await,
            (HttpMethod::Put | HttpMethod::Delete, None) => Err(CoreError::invalid_params(
                format!("{} on {} requires an id", method.as_str(), model.name),
            )),
        }
    }

    async fn find_many(
        &self,
        model: &ModelDescriptor,
        args: Value,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let query = process_query_args(&self.registry, model, args, PolicyOperation::Read, ctx, true)?;
        let mut rows = Value::Array(self.store.find_many(model.id, query).await?);
        post_process(&self.registry, &*self.store, model, &mut rows, PolicyOperation::Read, ctx)
            .await?;
        Ok(HandlerResponse::new(200, rows))
    }

    async fn find_one(
        &self,
        model: &ModelDescriptor,
        id: &str,
        args: Value,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let mut args = shape_args(args, false)?;
        args.insert("where".to_string(), id_filter(model, id)?);

        let query = process_query_args(
            &self.registry,
            model,
            Value::Object(args),
            PolicyOperation::Read,
            ctx,
            true,
        )?;
        let mut entity = self
            .store
            .find_first(model.id, query)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("{} {}", model.name, id)))?;
        post_process(&self.registry, &*self.store, model, &mut entity, PolicyOperation::Read, ctx)
            .await?;
        Ok(HandlerResponse::new(200, entity))
    }

    async fn create(
        &self,
        model: &ModelDescriptor,
        args: Value,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let mut shape = shape_args(args, true)?;
        let data = shape.remove("data").unwrap_or(Value::Null);

        let tx_id = Uuid::new_v4().to_string();
        let prepared = prepare_write(&self.registry, model, PolicyOperation::Create, data, &tx_id, ctx)?;

        let tx = self.store.begin().await?;
        let result: CoreResult<Value> = async {
            let mut select = Map::new();
            select.insert(model.id_field.clone(), Value::Bool(true));
            let created = tx
                .create(model.id, json!({ "data": prepared.data, "select": select }))
                .await?;
            let id = created.get(&model.id_field).cloned().unwrap_or(Value::Null);

            verify::verify_writes(&self.registry, &*tx, &prepared.included, &tx_id, ctx).await?;
            self.read_back(&*tx, model, id, shape, PolicyOperation::Create, ctx).await
        }
        .await;

        let entity = settle(tx, result).await?;
        Ok(HandlerResponse::new(201, entity))
    }

    async fn update(
        &self,
        model: &ModelDescriptor,
        id: &str,
        args: Value,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let mut shape = shape_args(args, true)?;
        let data = shape.remove("data").unwrap_or(Value::Null);
        let filter = id_filter(model, id)?;

        self.check_pre_write(model, filter.clone(), &data, ctx).await?;

        let tx_id = Uuid::new_v4().to_string();
        let prepared = prepare_write(&self.registry, model, PolicyOperation::Update, data, &tx_id, ctx)?;

        let tx = self.store.begin().await?;
        let result: CoreResult<Value> = async {
            let mut select = Map::new();
            select.insert(model.id_field.clone(), Value::Bool(true));
            let updated = tx
                .update(
                    model.id,
                    json!({ "where": filter, "data": prepared.data, "select": select }),
                )
                .await?;
            let id = updated.get(&model.id_field).cloned().unwrap_or(Value::Null);

            verify::verify_writes(&self.registry, &*tx, &prepared.included, &tx_id, ctx).await?;
            self.read_back(&*tx, model, id, shape, PolicyOperation::Update, ctx).await
        }
        .await;

        let entity = settle(tx, result).await?;
        Ok(HandlerResponse::new(200, entity))
    }

    async fn delete(
        &self,
        model: &ModelDescriptor,
        id: &str,
        args: Value,
        ctx: &QueryContext,
    ) -> CoreResult<HandlerResponse> {
        let shape = shape_args(args, false)?;
        let filter = id_filter(model, id)?;
        // the deleted entity is returned, so its relations are read-guarded
        let shape = process_query_args(
            &self.registry,
            model,
            Value::Object(shape),
            PolicyOperation::Read,
            ctx,
            false,
        )?;
        let Value::Object(mut shape) = shape else {
            return Err(CoreError::unknown("delete shape is not an object"));
        };

        let tx = self.store.begin().await?;
        let result: CoreResult<Value> = async {
            let guarded = process_query_args(
                &self.registry,
                model,
                json!({ "where": filter.clone() }),
                PolicyOperation::Delete,
                ctx,
                true,
            )?;
            if tx.count(model.id, guarded).await? == 0 {
                return Err(CoreError::denied(format!(
                    "delete of {} {} is not allowed",
                    model.name, id
                )));
            }

            shape.insert("where".to_string(), filter);
            let mut deleted = tx.delete(model.id, Value::Object(shape)).await?;
            post_process(&self.registry, &*tx, model, &mut deleted, PolicyOperation::Read, ctx)
                .await?;
            Ok::<_, CoreError>(deleted)
        }
        .await;

        let entity = settle(tx, result).await?;
        Ok(HandlerResponse::new(200, entity))
    }

    /// Prove the update target and every to-one it writes through currently
    /// pass the update guard. Runs outside any transaction.
    async fn check_pre_write(
        &self,
        model: &ModelDescriptor,
        filter: Value,
        data: &Value,
        ctx: &QueryContext,
    ) -> CoreResult<()> {
        let args = pre_write_guard_args(&self.registry, model, filter, data)?;
        let query = process_query_args(&self.registry, model, args, PolicyOperation::Update, ctx, true)?;

        let Some(mut found) = self.store.find_first(model.id, query).await? else {
            return Err(CoreError::denied(format!(
                "update of {} is not allowed",
                model.name
            )));
        };
        let hidden = post_process(
            &self.registry,
            &*self.store,
            model,
            &mut found,
            PolicyOperation::Update,
            ctx,
        )
        .await?;
        if hidden {
            return Err(CoreError::denied(format!(
                "a related entity of {} may not be updated",
                model.name
            )));
        }
        Ok(())
    }

    /// Re-fetch a written entity with the caller's selection under the read
    /// guard. A missing root or a dropped to-one fails the request.
    async fn read_back<E>(
        &self,
        exec: &E,
        model: &ModelDescriptor,
        id: Value,
        mut shape: Map<String, Value>,
        operation: PolicyOperation,
        ctx: &QueryContext,
    ) -> CoreResult<Value>
    where
        E: Executor + ?Sized,
    {
        let mut filter = Map::new();
        filter.insert(model.id_field.clone(), id);
        shape.insert("where".to_string(), Value::Object(filter));

        let query = process_query_args(
            &self.registry,
            model,
            Value::Object(shape),
            PolicyOperation::Read,
            ctx,
            true,
        )?;
        let Some(mut entity) = exec.find_first(model.id, query).await? else {
            return Err(CoreError::ReadBackAfterWriteDenied(format!(
                "result of {} on {} is not readable",
                operation, model.name
            )));
        };
        if post_process(&self.registry, exec, model, &mut entity, PolicyOperation::Read, ctx).await? {
            return Err(CoreError::ReadBackAfterWriteDenied(format!(
                "part of the {} result on {} is not readable",
                operation, model.name
            )));
        }
        Ok(entity)
    }
}

impl std::fmt::Debug for PolicyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyHandler")
            .field("models", &self.registry.models().count())
            .finish_non_exhaustive()
    }
}

/// Commit on success, roll back on error
async fn settle<T>(tx: Box<dyn Transaction>, result: CoreResult<T>) -> CoreResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                error!(error = %rollback, "rollback failed");
            }
            warn!(code = err.code(), "transaction rolled back");
            Err(err)
        }
    }
}

/// Keep `select` / `include` (and `data` for writes); reject anything else
fn shape_args(args: Value, with_data: bool) -> CoreResult<Map<String, Value>> {
    let args = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(CoreError::invalid_params(format!(
                "request arguments must be an object, found {}",
                other
            )))
        }
    };

    if with_data && !args.contains_key("data") {
        return Err(CoreError::invalid_params("missing data"));
    }
    if let Some(key) = args
        .keys()
        .find(|k| !matches!(k.as_str(), "select" | "include") && !(with_data && k.as_str() == "data"))
    {
        return Err(CoreError::invalid_params(format!("unexpected argument '{}'", key)));
    }
    Ok(args)
}

/// `where` for a path id, typed after the model's id field
fn id_filter(model: &ModelDescriptor, raw: &str) -> CoreResult<Value> {
    let numeric = model
        .id_field_info()
        .is_some_and(|f| matches!(f.type_name.as_str(), "Int" | "BigInt"));
    let id = if numeric {
        let n: i64 = raw
            .parse()
            .map_err(|_| CoreError::invalid_params(format!("invalid id for {}: {}", model.name, raw)))?;
        Value::from(n)
    } else {
        Value::String(raw.to_string())
    };

    let mut filter = Map::new();
    filter.insert(model.id_field.clone(), id);
    Ok(Value::Object(filter))
}
