//! Wire protocol: command envelopes, typed payloads, and outbound events.
//!
//! Every message-channel frame is one UTF-8 JSON object. Inbound frames
//! deserialise into [`Envelope`]; outbound frames serialise from
//! [`BridgeEvent`].

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorCode;

/// Protocol version announced in the `connected` greeting.
pub const PROTOCOL_VERSION: &str = "1";

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "pair",
    "authenticate",
    "init-session",
    "start-agent-session",
    "create-worktree",
    "git-status",
    "git-command",
    "execute-prompt",
    "approve-plan",
    "reject-plan",
    "abort-execution",
    "agent-interaction",
    "agent-feedback",
    "generate-pr",
    "cleanup-worktree",
    "health-check",
    "emergency-kill",
];

/// Types that may arrive before the connection holds a session.
pub const UNAUTHENTICATED_TYPES: &[&str] = &["pair", "authenticate", "health-check"];

/// The single type exempt from the signature requirement.
pub const UNSIGNED_TYPES: &[&str] = &["health-check"];

/// One inbound command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-unique message id, echoed on replies.
    pub id: String,
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// RFC 3339 UTC timestamp as sent; the exact string is signature input.
    pub timestamp: String,
    /// Optional client nonce, included in the signed payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 RSA signature over the canonical payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

// ── Typed inbound payloads ───────────────────────────────────────────────────

/// `pair` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairPayload {
    /// Pairing code obtained out-of-band.
    pub code: String,
    /// Client RSA public key, PEM.
    pub client_public_key: String,
}

/// `authenticate` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatePayload {
    /// Bearer token from pairing or a previous rotation.
    pub token: String,
}

/// `init-session` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSessionPayload {
    /// Working directory for subsequent agent runs.
    pub workdir: String,
    /// Agent kind to use for this session.
    pub agent_type: Option<String>,
}

/// `create-worktree` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorktreePayload {
    /// Workdir of the repository to branch from.
    pub workdir: String,
    /// Base branch; the adapter's default when absent.
    pub base_branch: Option<String>,
}

/// `git-status` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct GitStatusPayload {
    /// Directory to report on.
    pub workdir: String,
}

/// Subcommands accepted by `git-command`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GitCommandKind {
    CreateBranch,
    SwitchBranch,
    Stash,
}

/// `git-command` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct GitCommandPayload {
    /// Which operation to run.
    pub command: GitCommandKind,
    /// Repository directory.
    pub workdir: String,
    /// Operation arguments (e.g. the branch name).
    #[serde(default)]
    pub args: Vec<String>,
}

/// Execution mode for `execute-prompt`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Produce a plan for approval.
    Plan,
    /// Execute a previously approved plan.
    Execute,
}

/// Options object of `execute-prompt`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    /// Approved plan to execute (required for `mode: execute`).
    pub plan_id: Option<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// Agent kind override.
    pub agent_type: Option<String>,
}

/// `execute-prompt` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutePromptPayload {
    /// The user's prompt.
    pub prompt: String,
    /// Plan or execute.
    pub mode: PromptMode,
    /// Mode-specific options.
    #[serde(default)]
    pub options: ExecuteOptions,
}

/// `approve-plan` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovePlanPayload {
    /// Plan to approve.
    pub plan_id: String,
}

/// `reject-plan` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectPlanPayload {
    /// Plan to reject.
    pub plan_id: String,
    /// Why the operator rejected it.
    pub reason: Option<String>,
}

/// `abort-execution` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortExecutionPayload {
    /// Execution to abort.
    pub execution_id: String,
    /// Optional reason recorded on the execution.
    pub reason: Option<String>,
}

/// `agent-interaction` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentInteractionPayload {
    /// Text forwarded to the live agent's stdin.
    pub message: String,
    /// Interaction classification (free-form).
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `agent-feedback` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFeedbackPayload {
    /// Execution the feedback belongs to.
    pub execution_id: String,
    /// Feedback text.
    pub feedback: String,
}

/// `generate-pr` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePrPayload {
    /// Execution whose changes should be proposed.
    pub execution_id: String,
    /// Pull-request title.
    pub title: Option<String>,
    /// Pull-request description.
    pub description: Option<String>,
    /// Base branch for the pull request.
    pub base_branch: Option<String>,
}

/// `cleanup-worktree` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupWorktreePayload {
    /// Execution whose worktree should be removed.
    pub execution_id: String,
}

/// `emergency-kill` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmergencyKillPayload {
    /// Operator-provided reason, recorded in the audit trail.
    pub reason: Option<String>,
}

// ── Outbound events ──────────────────────────────────────────────────────────

/// Descriptor of an installed agent binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    /// Agent kind name.
    pub name: String,
    /// Version string reported by the binary.
    pub version: String,
    /// Resolved binary path.
    pub path: String,
    /// Whether the integration is marked beta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta: Option<bool>,
}

/// Metadata attached to a plan proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    /// Rough complexity classification.
    pub complexity: String,
    /// Rough risk classification.
    pub risk_level: String,
    /// Human-readable duration estimate.
    pub estimated_duration: String,
}

/// Output stream tag for agent output frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Every frame the bridge can send to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeEvent {
    /// Greeting sent immediately after accept.
    #[serde(rename_all = "camelCase")]
    Connected { version: String },
    /// Successful `pair` verb.
    #[serde(rename_all = "camelCase")]
    PairingSuccess {
        session_id: String,
        token: String,
        bridge_public_key: String,
        expires_at: DateTime<Utc>,
    },
    /// Successful `authenticate` verb; `token` is the latest (possibly
    /// rotated) bearer token.
    #[serde(rename_all = "camelCase")]
    AuthSuccess { session_id: String, token: String },
    /// Failed `authenticate` verb.
    #[serde(rename_all = "camelCase")]
    AuthFailed { reason: String },
    /// Installed agents, sent after authentication and on demand.
    #[serde(rename_all = "camelCase")]
    AgentsAvailable { agents: Vec<AgentDescriptor> },
    /// Workspace status report.
    #[serde(rename_all = "camelCase")]
    GitStatus { workdir: String, status: Value },
    /// A freshly produced plan awaiting approval.
    #[serde(rename_all = "camelCase")]
    AgentPlan {
        id: String,
        prompt: String,
        plan: String,
        modified_files: Vec<String>,
        metadata: PlanMetadata,
        approved: bool,
    },
    /// Acknowledges `approve-plan`.
    #[serde(rename_all = "camelCase")]
    PlanApproved { plan_id: String },
    /// Acknowledges `reject-plan`.
    #[serde(rename_all = "camelCase")]
    PlanRejected { plan_id: String },
    /// One framed chunk of agent stdout or stderr.
    #[serde(rename_all = "camelCase")]
    AgentOutput {
        execution_id: String,
        stream: StreamKind,
        data: String,
        ts: DateTime<Utc>,
    },
    /// Agent subprocess state transition.
    #[serde(rename_all = "camelCase")]
    AgentStateChange { execution_id: String, state: String },
    /// Files known to the workspace, optionally scoped to an execution.
    #[serde(rename_all = "camelCase")]
    FileList {
        files: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    /// Diff of one file.
    #[serde(rename_all = "camelCase")]
    FileDiff {
        file: String,
        diff: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    /// A file changed inside the workspace during an execution.
    #[serde(rename_all = "camelCase")]
    FileChanged { execution_id: String, file: String },
    /// A worktree was created for an execution.
    #[serde(rename_all = "camelCase")]
    WorktreeCreated {
        path: String,
        branch: String,
    },
    /// A worktree was removed.
    #[serde(rename_all = "camelCase")]
    WorktreeDeleted { path: String },
    /// An execution left the queue.
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: String,
        plan_id: String,
    },
    /// Progress checkpoint.
    #[serde(rename_all = "camelCase")]
    ExecutionProgress {
        execution_id: String,
        status: String,
        progress: u8,
    },
    /// Terminal success.
    #[serde(rename_all = "camelCase")]
    ExecutionComplete {
        execution_id: String,
        plan_id: String,
        modified_files: Vec<String>,
        result: String,
    },
    /// Terminal failure or abort.
    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        execution_id: String,
        error: String,
    },
    /// A pull request was authored.
    #[serde(rename_all = "camelCase")]
    PrCreated {
        execution_id: String,
        url: String,
    },
    /// Kill-switch acknowledgement.
    #[serde(rename_all = "camelCase")]
    EmergencyKillConfirmed {
        aborted_executions: Vec<String>,
        terminated_sessions: Vec<String>,
    },
    /// Error reply; `id` echoes the offending message id when available.
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        code: ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl BridgeEvent {
    /// Build an error event from an [`crate::AppError`], echoing `id`.
    #[must_use]
    pub fn error(err: &crate::AppError, id: Option<String>) -> Self {
        Self::Error {
            error: err.to_string(),
            code: err.code(),
            id,
        }
    }
}
