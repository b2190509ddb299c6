//! HTTP Boundary Tests
//!
//! Verb mapping, status codes and error bodies through the axum router:
//! - GET lists and reads, POST creates (201), PUT updates, DELETE deletes
//! - Missing ids, malformed bodies and unknown models are 400
//! - Bearer tokens become the policy principal; bad tokens are 401
//! - Policy failures are 403 with a stable error code

use std::sync::Arc;

use aeroguard::auth::JwtManager;
use aeroguard::config::GuardConfig;
use aeroguard::handler::PolicyHandler;
use aeroguard::rest_api::GuardServer;
use aeroguard::schema::SchemaLoader;
use aeroguard::store::InMemoryStore;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tower::ServiceExt;

// =============================================================================
// Helper Functions
// =============================================================================

const SCHEMA: &str = r#"{"models": [
    {"name": "Note", "fields": [
        {"name": "id", "type": "Int", "attributes": ["id"]},
        {"name": "body", "type": "String"},
        {"name": "ownerId", "type": "String", "optional": true},
        {"name": "createdAt", "type": "DateTime", "optional": true, "attributes": ["default(now)"]}
    ], "policies": {"allow": {
        "read": [{"ownerId": {"$auth": "id"}}],
        "create": [{"ownerId": {"$auth": "id"}}],
        "update": [{"ownerId": {"$auth": "id"}}],
        "delete": [{"ownerId": {"$auth": "id"}}]
    }}}
]}"#;

/// Loads config and schema from disk the way the binary does
fn setup() -> (TempDir, Router, JwtManager) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("schema.json"), SCHEMA).unwrap();
    let config_path = dir.path().join("aeroguard.json");
    std::fs::write(
        &config_path,
        r#"{"port": 8080, "schema_path": "schema.json", "jwt_secret": "boundary-test-secret"}"#,
    )
    .unwrap();

    let config = GuardConfig::load(&config_path).unwrap();
    let registry = Arc::new(SchemaLoader::load_path(&config.schema_path).unwrap());
    let store = Arc::new(InMemoryStore::new(registry.clone()));
    let jwt = JwtManager::new(config.jwt());

    let router = GuardServer::new(config, PolicyHandler::new(registry, store)).router();
    (dir, router, jwt)
}

fn bearer(jwt: &JwtManager, user: &str) -> String {
    format!("Bearer {}", jwt.issue(user, Map::new()).unwrap())
}

fn encode_query(value: &Value) -> String {
    value
        .to_string()
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{:02X}", other),
        })
        .collect()
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<&str>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        request = request.header(header::AUTHORIZATION, auth);
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

// =============================================================================
// Verb Mapping Tests
// =============================================================================

#[tokio::test]
async fn test_crud_round_trip_over_http() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");

    let (status, body) = send(
        &router,
        "POST",
        "/api/Note",
        Some(&alice),
        Some(r#"{"data": {"body": "hello", "ownerId": "alice"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], json!(1));
    assert_eq!(body["data"]["createdAt"]["type"], json!("DateTime"));

    let (status, body) = send(&router, "GET", "/api/Note", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &router,
        "PUT",
        "/api/Note/1",
        Some(&alice),
        Some(r#"{"data": {"body": "edited"}, "select": {"body": true}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({"body": "edited"}));

    let (status, body) = send(&router, "DELETE", "/api/Note/1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["body"], json!("edited"));

    let (status, body) = send(&router, "GET", "/api/Note/1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("ENTITY_NOT_FOUND"));
}

#[tokio::test]
async fn test_list_query_arguments() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");

    for text in ["b", "a", "c"] {
        let body = json!({"data": {"body": text, "ownerId": "alice"}}).to_string();
        let (status, _) = send(&router, "POST", "/api/Note", Some(&alice), Some(&body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let q = encode_query(&json!({
        "orderBy": {"body": "asc"},
        "take": 2,
        "select": {"body": true}
    }));
    let (status, body) = send(&router, "GET", &format!("/api/Note?q={}", q), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([{"body": "a"}, {"body": "b"}]));
}

// =============================================================================
// Input Error Tests
// =============================================================================

#[tokio::test]
async fn test_missing_id_rejected() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");

    let (status, body) = send(
        &router,
        "PUT",
        "/api/Note",
        Some(&alice),
        Some(r#"{"data": {"body": "x"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST_PARAMS"));

    let (status, body) = send(&router, "DELETE", "/api/Note", Some(&alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST_PARAMS"));
}

#[tokio::test]
async fn test_malformed_input_rejected() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");

    let (status, body) = send(&router, "POST", "/api/Note", Some(&alice), Some("{nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST_PARAMS"));

    let (status, _) = send(&router, "POST", "/api/Note", Some(&alice), Some("{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "GET", "/api/Note?q=%7Bbad", Some(&alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&router, "GET", "/api/Ghost", Some(&alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST_PARAMS"));
}

// =============================================================================
// Identity and Policy Tests
// =============================================================================

#[tokio::test]
async fn test_bad_token_rejected() {
    let (_dir, router, _jwt) = setup();

    let (status, body) = send(&router, "GET", "/api/Note", Some("Bearer not.a.token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("INVALID_TOKEN"));

    let (status, _) = send(&router, "GET", "/api/Note", Some("Basic abc"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_anonymous_sees_nothing() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");
    send(
        &router,
        "POST",
        "/api/Note",
        Some(&alice),
        Some(r#"{"data": {"body": "private", "ownerId": "alice"}}"#),
    )
    .await;

    let (status, body) = send(&router, "GET", "/api/Note", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_policy_denial_is_forbidden() {
    let (_dir, router, jwt) = setup();
    let alice = bearer(&jwt, "alice");
    let bob = bearer(&jwt, "bob");

    let (status, body) = send(
        &router,
        "POST",
        "/api/Note",
        Some(&bob),
        Some(r#"{"data": {"body": "forged", "ownerId": "alice"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], json!("DENIED_BY_POLICY"));
    assert!(body["error"].get("providerCode").is_none());

    send(
        &router,
        "POST",
        "/api/Note",
        Some(&alice),
        Some(r#"{"data": {"body": "mine", "ownerId": "alice"}}"#),
    )
    .await;

    let (status, _) = send(&router, "DELETE", "/api/Note/1", Some(&bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&router, "GET", "/api/Note/1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health() {
    let (_dir, router, _jwt) = setup();
    let (status, body) = send(&router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}
