//! HTTP surface: auth gate, status codes, shapes, and rate limiting.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use aperture::agents::mock::MockBackend;
use aperture::api::{AppState, build_router};
use aperture::core::AgentKind;
use aperture::vault::CredentialVault;

async fn test_router(vault: Option<Arc<CredentialVault>>, overrides: &[(&str, &str)]) -> Router {
    let claude = MockBackend::new(AgentKind::ClaudeSdk).with_backend_session_id("bk-1");
    let pi = MockBackend::new(AgentKind::PiSdk);
    let (manager, store) = common::mock_manager(claude, pi, vault, 10).await;
    let config = Arc::new(common::test_config(overrides));
    build_router(AppState {
        manager,
        store,
        config,
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", "Bearer tok")
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", "Bearer tok")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_session_body() -> Value {
    json!({
        "agent": "claude_sdk",
        "auth": {
            "mode": "api_key",
            "providerKey": "anthropic",
            "apiKeyRef": "inline",
            "apiKey": "sk-abc"
        }
    })
}

#[tokio::test]
async fn test_healthz_bypasses_auth() {
    let router = test_router(None, &[]).await;
    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_readyz_reports_ready_with_mock_backends() {
    let router = test_router(None, &[]).await;
    let response = router
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ready");
}

#[tokio::test]
async fn test_auth_rejections_are_distinguishable() {
    let router = test_router(None, &[]).await;

    let missing = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(missing).await["code"], "missing");

    let malformed = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/sessions")
                .header("authorization", "NotBearer tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(malformed).await["code"], "malformed");

    let wrong = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/sessions")
                .header("authorization", "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong).await["code"], "wrong");

    // The query-parameter path works for stream-open endpoints.
    let via_query = router
        .oneshot(
            Request::builder()
                .uri("/v1/sessions?token=tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(via_query.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let router = test_router(None, &[]).await;

    // Create.
    let created = router
        .clone()
        .oneshot(post_json("/v1/sessions", &create_session_body()))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    assert_eq!(created["agent"], "claude_sdk");
    assert_eq!(created["status"], "active");
    let id = created["id"].as_str().unwrap().to_owned();

    // List.
    let listed = router.clone().oneshot(get("/v1/sessions")).await.unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = body_json(listed).await;
    assert_eq!(listed["total"], 1);

    // Snapshot.
    let snapshot = router
        .clone()
        .oneshot(get(&format!("/v1/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(snapshot.status(), StatusCode::OK);
    let snapshot = body_json(snapshot).await;
    assert_eq!(snapshot["session"]["id"], id.as_str());
    // No cleartext key in any session payload.
    assert!(snapshot["session"]["auth"].get("apiKey").is_none());

    // Connect on a live session: not a restore.
    let connected = router
        .clone()
        .oneshot(post_json(&format!("/v1/sessions/{id}/connect"), &json!({})))
        .await
        .unwrap();
    assert_eq!(connected.status(), StatusCode::OK);
    assert_eq!(body_json(connected).await["restored"], false);

    // Messages: empty history is a valid page.
    let messages = router
        .clone()
        .oneshot(get(&format!("/v1/sessions/{id}/messages?limit=10&offset=0")))
        .await
        .unwrap();
    assert_eq!(messages.status(), StatusCode::OK);
    let messages = body_json(messages).await;
    assert_eq!(messages["total"], 0);
    assert_eq!(messages["limit"], 10);

    // Terminate.
    let deleted = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/sessions/{id}"))
                .header("authorization", "Bearer tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    // The resumable listing stays queryable (an explicit terminate is not
    // resumable, so the set may be empty).
    let resumable = router
        .clone()
        .oneshot(get("/v1/sessions/resumable"))
        .await
        .unwrap();
    assert_eq!(resumable.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let router = test_router(None, &[]).await;
    let id = uuid::Uuid::new_v4();

    let response = router
        .clone()
        .oneshot(get(&format!("/v1/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .oneshot(get(&format!("/v1/sessions/{id}/messages")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_create_is_400() {
    let router = test_router(None, &[]).await;

    // Claude with an openai key is rejected at creation.
    let body = json!({
        "agent": "claude_sdk",
        "auth": {
            "mode": "api_key",
            "providerKey": "openai",
            "apiKeyRef": "inline",
            "apiKey": "sk-oai"
        }
    });
    let response = router
        .oneshot(post_json("/v1/sessions", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_credentials_require_vault() {
    let router = test_router(None, &[]).await;
    let body = json!({"provider": "anthropic", "label": "work", "apiKey": "sk-1"});
    let response = router
        .clone()
        .oneshot(post_json("/v1/credentials", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = router.oneshot(get("/v1/credentials")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_credential_crud_with_vault() {
    let (_dir, vault) = common::temp_vault().await;
    let router = test_router(Some(vault), &[]).await;

    let created = router
        .clone()
        .oneshot(post_json(
            "/v1/credentials",
            &json!({"provider": "anthropic", "label": "work", "apiKey": "sk-secret"}),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let id = body_json(created).await["id"].as_str().unwrap().to_owned();

    // Listing never echoes plaintext.
    let listed = router.clone().oneshot(get("/v1/credentials")).await.unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = body_json(listed).await;
    assert_eq!(listed["credentials"][0]["label"], "work");
    assert!(!listed.to_string().contains("sk-secret"));

    let deleted = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/credentials/{id}"))
                .header("authorization", "Bearer tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/credentials/{id}"))
                .header("authorization", "Bearer tok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limit_returns_429_with_retry_after() {
    let router = test_router(None, &[("RATE_LIMIT_MAX", "2")]).await;

    for _ in 0..2 {
        let ok = router.clone().oneshot(get("/v1/sessions")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    let limited = router.oneshot(get("/v1/sessions")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn test_session_limit_returns_429() {
    let claude = MockBackend::new(AgentKind::ClaudeSdk);
    let pi = MockBackend::new(AgentKind::PiSdk);
    let (manager, store) = common::mock_manager(claude, pi, None, 1).await;
    let router = build_router(AppState {
        manager,
        store,
        config: Arc::new(common::test_config(&[])),
    });

    let first = router
        .clone()
        .oneshot(post_json("/v1/sessions", &create_session_body()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = router
        .oneshot(post_json("/v1/sessions", &create_session_body()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}
