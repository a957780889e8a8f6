//! Integration tests for the HTTP control surface.
//!
//! Drives the axum router directly with `tower::ServiceExt::oneshot`;
//! no sockets are involved.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use prompt_dock::server::http;

use super::test_helpers::{test_config, test_state, GOOD_ORIGIN};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .body(Body::empty())
        .expect("request")
}

fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_reports_status_and_session_count() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state);

    let response = router.oneshot(get("/health")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body.get("status").and_then(Value::as_str), Some("ok"));
    assert_eq!(body.get("activeSessions").and_then(Value::as_u64), Some(0));
    assert!(body.get("version").is_some());
    assert!(body.get("uptime").is_some());
}

#[tokio::test]
async fn pairing_generate_requires_both_fields() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state);

    let response = router
        .oneshot(post_json(
            "/api/pairing/generate",
            &json!({ "appName": "X" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pairing_roundtrip_mints_a_session() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state.clone());

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/pairing/generate",
            &json!({ "appName": "X", "appUrl": "https://x.test" }),
        ))
        .await
        .expect("generate response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let code = body.get("code").and_then(Value::as_str).expect("code");
    assert_eq!(code.len(), 14, "AAAA-BBBB-CCCC shape");
    assert!(body.get("bridgePublicKey").is_some());

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/pairing/verify",
            &json!({ "code": code, "clientPublicKey": "CLIENT-PEM" }),
        ))
        .await
        .expect("verify response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .expect("sessionId");
    assert!(body.get("token").is_some());

    // The session is now enumerable and revocable.
    let response = router
        .clone()
        .oneshot(get("/api/sessions"))
        .await
        .expect("sessions response");
    let body = body_json(response).await;
    let sessions = body
        .get("sessions")
        .and_then(Value::as_array)
        .expect("array");
    assert!(sessions
        .iter()
        .any(|s| s.get("id").and_then(Value::as_str) == Some(session_id)));

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{session_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("revoke response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{session_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("second revoke response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn verify_failures_are_uniform() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state);

    for body in [
        json!({ "code": "0000-0000-0000", "clientPublicKey": "PEM" }),
        json!({ "clientPublicKey": "PEM" }),
        json!({ "code": "0000-0000-0000" }),
    ] {
        let response = router
            .clone()
            .oneshot(post_json("/api/pairing/verify", &body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = body_json(response).await;
        assert_eq!(
            parsed.get("error").and_then(Value::as_str),
            Some("invalid or expired code"),
            "every failure clause reads the same"
        );
    }
}

#[tokio::test]
async fn disallowed_origin_is_refused_with_403() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "https://evil.test")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, GOOD_ORIGIN)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn agents_endpoint_returns_a_list() {
    let (state, _guard) = test_state(test_config());
    let router = http::router(state);

    let response = router.oneshot(get("/api/agents")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.get("agents").and_then(Value::as_array).is_some());
}
