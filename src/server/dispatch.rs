//! Inbound message dispatch: validation, signature verification, session
//! admission, and per-verb handling.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AppState;
use crate::agent::AgentKind;
use crate::audit::{AuditAction, AuditEntry};
use crate::coordinator::plan_metadata;
use crate::protocol::codec;
use crate::protocol::{
    AbortExecutionPayload, AgentFeedbackPayload, AgentInteractionPayload, ApprovePlanPayload,
    AuthenticatePayload, BridgeEvent, CleanupWorktreePayload, CreateWorktreePayload,
    EmergencyKillPayload, Envelope, ExecutePromptPayload, GeneratePrPayload, GitCommandKind,
    GitCommandPayload, GitStatusPayload, InitSessionPayload, PairPayload, PromptMode,
    RejectPlanPayload, UNAUTHENTICATED_TYPES, PROTOCOL_VERSION,
};
use crate::session::SessionSnapshot;
use crate::session::store::{Admission, RejectReason};
use crate::workspace::PullRequestOptions;
use crate::{AppError, Result};

/// Per-connection dispatch state.
pub struct ConnState {
    /// Connection identifier (logging only).
    pub conn_id: String,
    /// The authenticated session, when `pair` or `authenticate` succeeded.
    pub session: Option<SessionSnapshot>,
    /// Default workdir from `init-session`.
    pub workdir: Option<PathBuf>,
    /// Default agent kind from `init-session`.
    pub agent_kind: Option<AgentKind>,
}

impl ConnState {
    /// Fresh unauthenticated connection state.
    #[must_use]
    pub fn new(conn_id: String) -> Self {
        Self {
            conn_id,
            session: None,
            workdir: None,
            agent_kind: None,
        }
    }
}

/// Serialise and enqueue one outbound event.
pub async fn send_event(out: &mpsc::Sender<Message>, event: &BridgeEvent) {
    match serde_json::to_string(event) {
        Ok(text) => {
            let _ = out.send(Message::text(text)).await;
        }
        Err(err) => warn!(%err, "failed to serialise outbound event"),
    }
}

async fn fail(out: &mpsc::Sender<Message>, err: &AppError, id: Option<String>) {
    send_event(out, &BridgeEvent::error(err, id)).await;
}

/// Validate, admit, and dispatch one inbound frame.
pub async fn handle_envelope(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    raw: &str,
    out: &mpsc::Sender<Message>,
) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Salvage the id for the error echo when the frame is at least
            // JSON.
            let id = serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(ToOwned::to_owned));
            fail(out, &AppError::InvalidMessage(err.to_string()), id).await;
            return;
        }
    };
    let id = envelope.id.clone();

    if let Err(err) = state.codec.validate(&envelope, Utc::now()) {
        fail(out, &err, Some(id)).await;
        return;
    }

    if let Err(err) = verify_signature(state, conn, &envelope) {
        if matches!(err, AppError::InvalidSignature) {
            audit(
                state,
                AuditEntry::new(AuditAction::SignatureRejected).with_data(json!({
                    "commandId": envelope.id,
                    "commandType": envelope.kind,
                })),
            );
        }
        fail(out, &err, Some(id)).await;
        return;
    }

    // Session + admission. Every type except the handshake verbs requires
    // an authenticated session; health-check is admitted against the rate
    // limiter whenever a session is present, so a chatty client cannot
    // sidestep the ceiling with unsigned pings.
    let needs_session = !UNAUTHENTICATED_TYPES.contains(&envelope.kind.as_str());
    let mut admitted = false;
    if needs_session || (envelope.kind == "health-check" && conn.session.is_some()) {
        let Some(session) = conn.session.clone() else {
            fail(out, &AppError::NotAuthenticated, Some(id)).await;
            return;
        };
        let Some(fresh) = state.sessions.get(&session.id) else {
            conn.session = None;
            fail(out, &AppError::SessionExpired, Some(id)).await;
            return;
        };
        if fresh.expires_at < Utc::now() {
            conn.session = None;
            fail(out, &AppError::SessionExpired, Some(id)).await;
            return;
        }

        let admission = state.sessions.admit_command(
            &session.id,
            &envelope.id,
            &envelope.kind,
            &codec::canonical_data(&envelope),
        );
        match admission {
            Ok(Admission::Admit { rotated_token }) => {
                admitted = true;
                if let Some(token) = rotated_token {
                    // The rotated token must reach the client: relay it as a
                    // fresh auth-success before the verb's own reply.
                    if let Some(s) = conn.session.as_mut() {
                        s.token = token.clone();
                    }
                    send_event(
                        out,
                        &BridgeEvent::AuthSuccess {
                            session_id: session.id.clone(),
                            token,
                        },
                    )
                    .await;
                }
            }
            Ok(Admission::Reject(RejectReason::RateLimited(secs))) => {
                fail(out, &AppError::RateLimited(secs), Some(id)).await;
                return;
            }
            Ok(Admission::Reject(RejectReason::Replay)) => {
                fail(out, &AppError::ReplayDetected, Some(id)).await;
                return;
            }
            Err(err) => {
                fail(out, &err, Some(id)).await;
                return;
            }
        }
    }

    let result = dispatch_verb(state, conn, &envelope, out).await;
    if admitted {
        if let Some(session) = &conn.session {
            state.sessions.command_finished(&session.id);
        }
    }
    if let Err(err) = result {
        fail(out, &err, Some(id)).await;
    }
}

/// Select the verification key per message type and verify.
fn verify_signature(state: &Arc<AppState>, conn: &ConnState, envelope: &Envelope) -> Result<()> {
    match envelope.kind.as_str() {
        // Presenting the key is part of the handshake.
        "pair" => {
            let payload: PairPayload = parse_data(envelope)?;
            state
                .codec
                .verify_signature(envelope, &payload.client_public_key)
        }
        "authenticate" => {
            let payload: AuthenticatePayload = parse_data(envelope)?;
            let (_, client_key) = state.sessions.client_key_for_token(&payload.token)?;
            state.codec.verify_signature(envelope, &client_key)
        }
        "health-check" => {
            // Signature optional; verified when present and a session is
            // bound.
            match (&envelope.signature, &conn.session) {
                (Some(_), Some(session)) => state
                    .codec
                    .verify_signature(envelope, &session.client_public_key),
                _ => Ok(()),
            }
        }
        _ => {
            let session = conn.session.as_ref().ok_or(AppError::NotAuthenticated)?;
            state
                .codec
                .verify_signature(envelope, &session.client_public_key)
        }
    }
}

async fn dispatch_verb(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    match envelope.kind.as_str() {
        "pair" => handle_pair(state, conn, envelope, out).await,
        "authenticate" => handle_authenticate(state, conn, envelope, out).await,
        "health-check" => {
            send_event(
                out,
                &BridgeEvent::Connected {
                    version: PROTOCOL_VERSION.to_owned(),
                },
            )
            .await;
            Ok(())
        }
        "init-session" => handle_init_session(state, conn, envelope, out).await,
        "start-agent-session" => {
            let agents = state.catalog.list_installed().await;
            send_event(out, &BridgeEvent::AgentsAvailable { agents }).await;
            Ok(())
        }
        "create-worktree" => handle_create_worktree(state, envelope, out).await,
        "git-status" => handle_git_status(state, envelope, out).await,
        "git-command" => handle_git_command(state, envelope, out).await,
        "execute-prompt" => handle_execute_prompt(state, conn, envelope, out).await,
        "approve-plan" => {
            let payload: ApprovePlanPayload = parse_data(envelope)?;
            let session = require_session(conn)?;
            let plan = state.coordinator.approve_plan(&session.id, &payload.plan_id)?;
            send_event(out, &BridgeEvent::PlanApproved { plan_id: plan.id }).await;
            Ok(())
        }
        "reject-plan" => {
            let payload: RejectPlanPayload = parse_data(envelope)?;
            let session = require_session(conn)?;
            let plan = state
                .coordinator
                .reject_plan(&session.id, &payload.plan_id, payload.reason.as_deref())
                .await?;
            send_event(out, &BridgeEvent::PlanRejected { plan_id: plan.id }).await;
            Ok(())
        }
        "abort-execution" => {
            let payload: AbortExecutionPayload = parse_data(envelope)?;
            let session = require_session(conn)?;
            state.coordinator.abort(&session.id, &payload.execution_id)?;
            send_event(
                out,
                &BridgeEvent::AgentStateChange {
                    execution_id: payload.execution_id,
                    state: "aborting".into(),
                },
            )
            .await;
            Ok(())
        }
        "agent-interaction" => {
            let payload: AgentInteractionPayload = parse_data(envelope)?;
            let session = require_session(conn)?;
            state.coordinator.interact(&session.id, &payload.message).await
        }
        "agent-feedback" => {
            let payload: AgentFeedbackPayload = parse_data(envelope)?;
            let session = require_session(conn)?;
            state
                .coordinator
                .feedback(&session.id, &payload.execution_id, &payload.feedback)
                .await
        }
        "generate-pr" => handle_generate_pr(state, conn, envelope, out).await,
        "cleanup-worktree" => handle_cleanup_worktree(state, conn, envelope, out).await,
        "emergency-kill" => {
            let payload: EmergencyKillPayload = parse_data_or_default(envelope)?;
            let reason = payload.reason.unwrap_or_else(|| "operator request".into());
            let aborted = state.coordinator.emergency_stop(&reason);
            let terminated = state.sessions.emergency_kill(&reason);
            conn.session = None;
            send_event(
                out,
                &BridgeEvent::EmergencyKillConfirmed {
                    aborted_executions: aborted,
                    terminated_sessions: terminated,
                },
            )
            .await;
            Ok(())
        }
        other => Err(AppError::InvalidMessage(format!("unrecognised type: {other}"))),
    }
}

// ── Verb handlers ────────────────────────────────────────────────────────────

async fn handle_pair(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: PairPayload = parse_data(envelope)?;
    let Some(redemption) = state
        .pairing
        .redeem(&payload.code, &payload.client_public_key)
    else {
        return Err(AppError::NotAuthenticated);
    };

    let session = state.sessions.create(&redemption)?;
    audit(
        state,
        AuditEntry::new(AuditAction::PairingCodeRedeemed).with_data(json!({
            "appName": redemption.app_name,
            "sessionId": session.id,
        })),
    );

    send_event(
        out,
        &BridgeEvent::PairingSuccess {
            session_id: session.id.clone(),
            token: session.token.clone(),
            bridge_public_key: state.identity.public_key_pem().to_owned(),
            expires_at: session.expires_at,
        },
    )
    .await;
    conn.session = Some(session);
    Ok(())
}

async fn handle_authenticate(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: AuthenticatePayload = parse_data(envelope)?;
    match state.sessions.resolve_by_token(&payload.token) {
        Ok(session) => {
            // The snapshot always carries the latest token; rotations are
            // relayed here by construction.
            send_event(
                out,
                &BridgeEvent::AuthSuccess {
                    session_id: session.id.clone(),
                    token: session.token.clone(),
                },
            )
            .await;
            let agents = state.catalog.list_installed().await;
            send_event(out, &BridgeEvent::AgentsAvailable { agents }).await;
            conn.session = Some(session);
            Ok(())
        }
        Err(err) => {
            debug!(conn_id = conn.conn_id, %err, "authentication failed");
            send_event(
                out,
                &BridgeEvent::AuthFailed {
                    reason: err.to_string(),
                },
            )
            .await;
            Ok(())
        }
    }
}

async fn handle_init_session(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: InitSessionPayload = parse_data(envelope)?;
    let workdir = PathBuf::from(&payload.workdir);
    if !workdir.is_dir() {
        return Err(AppError::Workspace(format!(
            "workdir {} does not exist",
            workdir.display()
        )));
    }

    conn.agent_kind = payload
        .agent_type
        .as_deref()
        .and_then(AgentKind::parse)
        .or(conn.agent_kind);
    conn.workdir = Some(workdir.clone());

    let status = workspace_status(state, workdir.clone()).await?;
    send_event(
        out,
        &BridgeEvent::GitStatus {
            workdir: payload.workdir,
            status: json!(status),
        },
    )
    .await;
    Ok(())
}

async fn handle_create_worktree(
    state: &Arc<AppState>,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: CreateWorktreePayload = parse_data(envelope)?;
    let workspace = Arc::clone(&state.workspace);
    let workdir = PathBuf::from(&payload.workdir);
    let base = payload.base_branch.clone();
    let info = tokio::task::spawn_blocking(move || {
        workspace.create_worktree(&workdir, base.as_deref())
    })
    .await
    .map_err(|err| AppError::Internal(format!("worktree task panicked: {err}")))??;

    send_event(
        out,
        &BridgeEvent::WorktreeCreated {
            path: info.path.display().to_string(),
            branch: info.branch,
        },
    )
    .await;
    Ok(())
}

async fn handle_git_status(
    state: &Arc<AppState>,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: GitStatusPayload = parse_data(envelope)?;
    let status = workspace_status(state, PathBuf::from(&payload.workdir)).await?;
    send_event(
        out,
        &BridgeEvent::GitStatus {
            workdir: payload.workdir,
            status: json!(status),
        },
    )
    .await;
    Ok(())
}

async fn handle_git_command(
    state: &Arc<AppState>,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: GitCommandPayload = parse_data(envelope)?;
    let workdir = PathBuf::from(&payload.workdir);
    let workspace = Arc::clone(&state.workspace);

    let dir = workdir.clone();
    tokio::task::spawn_blocking(move || match payload.command {
        GitCommandKind::CreateBranch => {
            let name = payload
                .args
                .first()
                .ok_or_else(|| AppError::InvalidMessage("create-branch needs a name".into()))?;
            workspace.create_branch(&dir, name)
        }
        GitCommandKind::SwitchBranch => {
            let name = payload
                .args
                .first()
                .ok_or_else(|| AppError::InvalidMessage("switch-branch needs a name".into()))?;
            workspace.switch_branch(&dir, name)
        }
        GitCommandKind::Stash => workspace
            .stash(&dir, payload.args.first().map(String::as_str))
            .map(|_| ()),
    })
    .await
    .map_err(|err| AppError::Internal(format!("git task panicked: {err}")))??;

    let status = workspace_status(state, workdir).await?;
    send_event(
        out,
        &BridgeEvent::GitStatus {
            workdir: payload.workdir,
            status: json!(status),
        },
    )
    .await;
    Ok(())
}

async fn handle_execute_prompt(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: ExecutePromptPayload = parse_data(envelope)?;
    let session = require_session(conn)?;

    match payload.mode {
        PromptMode::Plan => {
            let workdir = payload
                .options
                .workdir
                .map(PathBuf::from)
                .or_else(|| conn.workdir.clone())
                .ok_or_else(|| {
                    AppError::Workspace("no workdir; send init-session first".into())
                })?;
            let kind = payload
                .options
                .agent_type
                .as_deref()
                .and_then(AgentKind::parse)
                .or(conn.agent_kind)
                .unwrap_or_else(|| state.catalog.preferred());

            let plan = state
                .coordinator
                .submit_plan_request(&session.id, &payload.prompt, &workdir, kind)
                .await?;

            send_event(
                out,
                &BridgeEvent::AgentPlan {
                    id: plan.id.clone(),
                    prompt: plan.prompt.clone(),
                    plan: plan.plan_text.clone(),
                    modified_files: plan.modified_files_hint.clone(),
                    metadata: plan_metadata(&plan.plan_text),
                    approved: false,
                },
            )
            .await;
            Ok(())
        }
        PromptMode::Execute => {
            let plan_id = payload
                .options
                .plan_id
                .ok_or_else(|| AppError::PlanNotFound("missing planId".into()))?;
            // execution-started and everything after it arrive through the
            // coordinator's event stream.
            state.coordinator.execute_plan(&session.id, &plan_id)?;
            Ok(())
        }
    }
}

async fn handle_generate_pr(
    state: &Arc<AppState>,
    conn: &ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: GeneratePrPayload = parse_data(envelope)?;
    let session = require_session(conn)?;
    let execution = state
        .coordinator
        .get_execution(&payload.execution_id)
        .filter(|e| e.session_id == session.id)
        .ok_or_else(|| AppError::ExecutionNotFound(payload.execution_id.clone()))?;

    let workspace = Arc::clone(&state.workspace);
    let options = PullRequestOptions {
        title: payload.title,
        description: payload.description,
        base_branch: payload.base_branch,
    };
    let workdir = execution.workdir.clone();
    let url = tokio::task::spawn_blocking(move || {
        workspace.generate_pull_request(&workdir, &options)
    })
    .await
    .map_err(|err| AppError::Internal(format!("pr task panicked: {err}")))??;

    send_event(
        out,
        &BridgeEvent::PrCreated {
            execution_id: payload.execution_id,
            url,
        },
    )
    .await;
    Ok(())
}

async fn handle_cleanup_worktree(
    state: &Arc<AppState>,
    conn: &ConnState,
    envelope: &Envelope,
    out: &mpsc::Sender<Message>,
) -> Result<()> {
    let payload: CleanupWorktreePayload = parse_data(envelope)?;
    let session = require_session(conn)?;
    let execution = state
        .coordinator
        .get_execution(&payload.execution_id)
        .filter(|e| e.session_id == session.id)
        .ok_or_else(|| AppError::ExecutionNotFound(payload.execution_id.clone()))?;

    let workspace = Arc::clone(&state.workspace);
    let workdir = execution.workdir.clone();
    let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let status = workspace.status(&workdir)?;
        let branch = status.branch.unwrap_or_default();
        workspace.delete_worktree(&workdir, &workdir, &branch, true)?;
        Ok(workdir)
    })
    .await
    .map_err(|err| AppError::Internal(format!("cleanup task panicked: {err}")))??;

    send_event(
        out,
        &BridgeEvent::WorktreeDeleted {
            path: path.display().to_string(),
        },
    )
    .await;
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn require_session(conn: &ConnState) -> Result<&SessionSnapshot> {
    conn.session.as_ref().ok_or(AppError::NotAuthenticated)
}

fn parse_data<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    let data = envelope
        .data
        .clone()
        .ok_or_else(|| AppError::InvalidMessage("data object required".into()))?;
    serde_json::from_value(data)
        .map_err(|err| AppError::InvalidMessage(format!("bad {} data: {err}", envelope.kind)))
}

fn parse_data_or_default<T: serde::de::DeserializeOwned + Default>(
    envelope: &Envelope,
) -> Result<T> {
    match &envelope.data {
        None => Ok(T::default()),
        Some(data) => serde_json::from_value(data.clone())
            .map_err(|err| AppError::InvalidMessage(format!("bad {} data: {err}", envelope.kind))),
    }
}

async fn workspace_status(
    state: &Arc<AppState>,
    workdir: PathBuf,
) -> Result<crate::workspace::WorkspaceStatus> {
    let workspace = Arc::clone(&state.workspace);
    tokio::task::spawn_blocking(move || workspace.status(&workdir))
        .await
        .map_err(|err| AppError::Internal(format!("status task panicked: {err}")))?
}

fn audit(state: &AppState, entry: AuditEntry) {
    if let Err(err) = state.audit.log_entry(entry) {
        warn!(%err, "audit append failed");
    }
}
