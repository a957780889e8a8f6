//! Loopback HTTP control surface.
//!
//! Pairing issuance and verification, health, agent and session
//! enumeration, session revocation, and workspace status. Requests whose
//! declared origin is outside the allow-list are refused with 403 before
//! any handler runs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::AppState;
use crate::audit::{AuditAction, AuditEntry};
use crate::errors::ErrorCode;
use crate::{AppError, Result};

/// Crate version reported by `/health`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let origin_state = Arc::clone(&state);
    Router::new()
        .route("/health", get(health))
        .route("/api/pairing/generate", post(pairing_generate))
        .route("/api/pairing/verify", post(pairing_verify))
        .route("/api/agents", get(list_agents))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(revoke_session))
        .route("/api/git/status", get(git_status))
        .layer(middleware::from_fn(move |request: Request, next: Next| {
            let state = Arc::clone(&origin_state);
            async move { enforce_origin(&state, request, next).await }
        }))
        .with_state(state)
}

/// Serve the router until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` when the listener cannot bind.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    info!(%bind, "HTTP control surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Internal(format!("HTTP server error: {err}")))?;
    info!("HTTP control surface shut down");
    Ok(())
}

async fn enforce_origin(state: &AppState, request: Request, next: Next) -> Response {
    if let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
    {
        if !state.origin_allowed(origin) {
            warn!(origin, "HTTP request from disallowed origin");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "origin not allowed",
                    "code": ErrorCode::OriginNotAllowed,
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "uptime": state.started_at.elapsed().as_secs(),
        "activeSessions": state.sessions.len(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    app_name: Option<String>,
    app_url: Option<String>,
}

async fn pairing_generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateRequest>,
) -> Response {
    let (Some(app_name), Some(app_url)) = (body.app_name, body.app_url) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "appName and appUrl are required" })),
        )
            .into_response();
    };
    if app_name.is_empty() || app_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "appName and appUrl are required" })),
        )
            .into_response();
    }

    let code = state
        .pairing
        .issue(&app_name, &app_url, state.identity.public_key_pem());
    audit(
        &state,
        AuditEntry::new(AuditAction::PairingCodeIssued).with_data(json!({ "appName": app_name })),
    );

    Json(json!({
        "code": code.code,
        "expiresAt": code.expires_at,
        "bridgePublicKey": code.bridge_public_key,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    code: Option<String>,
    client_public_key: Option<String>,
}

async fn pairing_verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyRequest>,
) -> Response {
    let invalid = || {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid or expired code" })),
        )
            .into_response()
    };

    let (Some(code), Some(client_key)) = (body.code, body.client_public_key) else {
        return invalid();
    };
    let Some(redemption) = state.pairing.redeem(&code, &client_key) else {
        return invalid();
    };

    let session = match state.sessions.create(&redemption) {
        Ok(session) => session,
        Err(err) => {
            warn!(%err, "session creation failed after redemption");
            return invalid();
        }
    };
    audit(
        &state,
        AuditEntry::new(AuditAction::PairingCodeRedeemed).with_data(json!({
            "appName": redemption.app_name,
            "sessionId": session.id,
        })),
    );

    Json(json!({
        "token": session.token,
        "sessionId": session.id,
        "bridgePublicKey": state.identity.public_key_pem(),
        "expiresAt": session.expires_at,
    }))
    .into_response()
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.catalog.list_installed().await;
    Json(json!({ "agents": agents }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "appName": s.app_name,
                "createdAt": s.created_at,
                "lastActivity": s.last_activity,
            })
        })
        .collect();
    Json(json!({ "sessions": sessions }))
}

async fn revoke_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.sessions.revoke(&id) {
        state.coordinator.cancel_session(&id);
        state.coordinator.plans().drop_session(&id);
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct GitStatusQuery {
    workdir: String,
}

async fn git_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GitStatusQuery>,
) -> Response {
    let workspace = Arc::clone(&state.workspace);
    let dir = PathBuf::from(query.workdir);
    let result = tokio::task::spawn_blocking(move || workspace.status(&dir)).await;
    match result {
        Ok(Ok(status)) => Json(json!(status)).into_response(),
        Ok(Err(err)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string(), "code": err.code() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string(), "code": ErrorCode::Internal })),
        )
            .into_response(),
    }
}

fn audit(state: &AppState, entry: AuditEntry) {
    if let Err(err) = state.audit.log_entry(entry) {
        warn!(%err, "audit append failed");
    }
}
