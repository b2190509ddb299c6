//! # REST API HTTP Server
//!
//! Axum router exposing the policy handler:
//!
//! - `GET    /api/:model`       list, `?q=<json find args>`
//! - `GET    /api/:model/:id`   single, `?q=<json select/include>`
//! - `POST   /api/:model`       create, body `{data, select?, include?}`
//! - `PUT    /api/:model/:id`   update, same body
//! - `DELETE /api/:model/:id`   delete, `?q=` for the returned shape
//!
//! `PUT` and `DELETE` without an id reach the handler and fail there as
//! invalid input.
//!
//! Identity comes from `Authorization: Bearer <jwt>`; no header means an
//! anonymous principal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::JwtManager;
use crate::config::GuardConfig;
use crate::core::{HttpMethod, QueryContext};
use crate::handler::PolicyHandler;

use super::errors::{RestError, RestResult};

/// Shared router state
pub struct AppState {
    handler: PolicyHandler,
    jwt: JwtManager,
}

type ServerState = Arc<AppState>;

/// HTTP server for the policy handler
pub struct GuardServer {
    config: GuardConfig,
    router: Router,
}

impl GuardServer {
    pub fn new(config: GuardConfig, handler: PolicyHandler) -> Self {
        let state = Arc::new(AppState {
            handler,
            jwt: JwtManager::new(config.jwt()),
        });
        let router = build_router(state, &config.cors_origins);
        Self { config, router }
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind and serve until the process exits
    pub async fn start(self) -> Result<(), std::io::Error> {
        let addr: SocketAddr = self.config.socket_addr().parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e))
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "aeroguard listening");
        axum::serve(listener, self.router).await
    }
}

fn build_router(state: ServerState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = cors_origins.iter().filter_map(|s| s.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/:model",
            get(list_handler)
                .post(create_handler)
                .put(update_without_id_handler)
                .delete(delete_without_id_handler),
        )
        .route(
            "/api/:model/:id",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Resolve the request principal
fn extract_context(state: &AppState, headers: &HeaderMap) -> RestResult<QueryContext> {
    let Some(header) = headers.get(AUTHORIZATION) else {
        return Ok(QueryContext::anonymous());
    };
    let header = header
        .to_str()
        .map_err(|_| RestError::InvalidQueryParam("authorization header is not ASCII".to_string()))?;

    let user = state.jwt.principal(header)?;
    Ok(QueryContext::new(Some(user)))
}

/// Parse the `q` query parameter as JSON find arguments
fn query_args(query: &HashMap<String, String>) -> RestResult<Option<Value>> {
    query
        .get("q")
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| RestError::InvalidQueryParam(format!("q: {}", e)))
        })
        .transpose()
}

fn body_args(body: Result<Json<Value>, JsonRejection>) -> RestResult<Option<Value>> {
    body.map(|Json(value)| Some(value))
        .map_err(|e| RestError::InvalidBody(e.body_text()))
}

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    method: HttpMethod,
    model: &str,
    id: Option<&str>,
    args: Option<Value>,
) -> RestResult<(StatusCode, Json<Value>)> {
    let ctx = extract_context(state, headers)?;
    let response = state.handler.handle(method, model, id, args, &ctx).await?;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    Ok((status, Json(response.body)))
}

async fn health_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_handler(
    State(state): State<ServerState>,
    Path(model): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = query_args(&query)?;
    dispatch(&state, &headers, HttpMethod::Get, &model, None, args).await
}

async fn get_handler(
    State(state): State<ServerState>,
    Path((model, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = query_args(&query)?;
    dispatch(&state, &headers, HttpMethod::Get, &model, Some(&id), args).await
}

async fn create_handler(
    State(state): State<ServerState>,
    Path(model): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = body_args(body)?;
    dispatch(&state, &headers, HttpMethod::Post, &model, None, args).await
}

async fn update_handler(
    State(state): State<ServerState>,
    Path((model, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = body_args(body)?;
    dispatch(&state, &headers, HttpMethod::Put, &model, Some(&id), args).await
}

/// PUT without an id; rejected by the handler as bad input
async fn update_without_id_handler(
    State(state): State<ServerState>,
    Path(model): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = body_args(body)?;
    dispatch(&state, &headers, HttpMethod::Put, &model, None, args).await
}

async fn delete_without_id_handler(
    State(state): State<ServerState>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> RestResult<(StatusCode, Json<Value>)> {
    dispatch(&state, &headers, HttpMethod::Delete, &model, None, None).await
}

async fn delete_handler(
    State(state): State<ServerState>,
    Path((model, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<(StatusCode, Json<Value>)> {
    let args = query_args(&query)?;
    dispatch(&state, &headers, HttpMethod::Delete, &model, Some(&id), args).await
}
