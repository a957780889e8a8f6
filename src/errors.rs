//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Key generation, loading, signing, or verification failure.
    Crypto(String),
    /// Inbound envelope failed structural validation.
    InvalidMessage(String),
    /// Envelope carried no signature where one is required.
    MissingSignature,
    /// Signature verification failed.
    InvalidSignature,
    /// Connection has no authenticated session.
    NotAuthenticated,
    /// Session expired or token no longer validates.
    SessionExpired,
    /// Command rejected by the rate limiter; back-off seconds remaining.
    RateLimited(u64),
    /// Command fingerprint was seen before in this session.
    ReplayDetected,
    /// Command timestamp is older than the admissible window.
    CommandExpired,
    /// Command timestamp is further in the future than the skew tolerance.
    CommandFromFuture,
    /// Declared origin is not in the allow-list.
    OriginNotAllowed(String),
    /// Plan id does not resolve.
    PlanNotFound(String),
    /// Plan exists but is not in the APPROVED state.
    PlanNotApproved(String),
    /// Plan is owned by a different session.
    PlanOwnershipViolation(String),
    /// Plan has already been executed.
    PlanAlreadyExecuted(String),
    /// Execution id does not resolve.
    ExecutionNotFound(String),
    /// Execution is already in a terminal state.
    ExecutionAlreadyTerminal(String),
    /// Agent binary could not be located or spawned.
    AgentNotAvailable(String),
    /// Agent exceeded its configured timeout.
    AgentTimeout(String),
    /// Agent subprocess exited abnormally.
    AgentCrashed(String),
    /// Forwarded failure from the workspace adapter.
    Workspace(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Last-resort internal failure; always audit-logged at the call site.
    Internal(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Crypto(msg) => write!(f, "crypto: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            Self::MissingSignature => write!(f, "signature required but absent"),
            Self::InvalidSignature => write!(f, "signature verification failed"),
            Self::NotAuthenticated => write!(f, "no authenticated session"),
            Self::SessionExpired => write!(f, "session expired"),
            Self::RateLimited(secs) => write!(f, "rate limit exceeded, retry in {secs}s"),
            Self::ReplayDetected => write!(f, "command replay detected"),
            Self::CommandExpired => write!(f, "command timestamp too old"),
            Self::CommandFromFuture => write!(f, "command timestamp in the future"),
            Self::OriginNotAllowed(origin) => write!(f, "origin not allowed: {origin}"),
            Self::PlanNotFound(id) => write!(f, "plan not found: {id}"),
            Self::PlanNotApproved(id) => write!(f, "plan not approved: {id}"),
            Self::PlanOwnershipViolation(id) => {
                write!(f, "plan {id} belongs to a different session")
            }
            Self::PlanAlreadyExecuted(id) => write!(f, "plan already executed: {id}"),
            Self::ExecutionNotFound(id) => write!(f, "execution not found: {id}"),
            Self::ExecutionAlreadyTerminal(id) => {
                write!(f, "execution already terminal: {id}")
            }
            Self::AgentNotAvailable(msg) => write!(f, "agent not available: {msg}"),
            Self::AgentTimeout(msg) => write!(f, "agent timeout: {msg}"),
            Self::AgentCrashed(msg) => write!(f, "agent crashed: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMessage(err.to_string())
    }
}

impl From<git2::Error> for AppError {
    fn from(err: git2::Error) -> Self {
        Self::Workspace(err.to_string())
    }
}

/// Short error codes carried on the wire in `error` envelopes.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessageFormat,
    MissingSignature,
    InvalidSignature,
    NotAuthenticated,
    SessionExpired,
    RateLimitExceeded,
    ReplayDetected,
    CommandExpired,
    CommandFromFuture,
    OriginNotAllowed,
    PlanNotFound,
    PlanNotApproved,
    PlanOwnershipViolation,
    PlanAlreadyExecuted,
    ExecutionNotFound,
    ExecutionAlreadyTerminal,
    AgentNotAvailable,
    AgentTimeout,
    AgentCrashed,
    WorkspaceError,
    Internal,
}

impl AppError {
    /// Wire code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMessage(_) => ErrorCode::InvalidMessageFormat,
            Self::MissingSignature => ErrorCode::MissingSignature,
            Self::InvalidSignature | Self::Crypto(_) => ErrorCode::InvalidSignature,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::SessionExpired => ErrorCode::SessionExpired,
            Self::RateLimited(_) => ErrorCode::RateLimitExceeded,
            Self::ReplayDetected => ErrorCode::ReplayDetected,
            Self::CommandExpired => ErrorCode::CommandExpired,
            Self::CommandFromFuture => ErrorCode::CommandFromFuture,
            Self::OriginNotAllowed(_) => ErrorCode::OriginNotAllowed,
            Self::PlanNotFound(_) => ErrorCode::PlanNotFound,
            Self::PlanNotApproved(_) => ErrorCode::PlanNotApproved,
            Self::PlanOwnershipViolation(_) => ErrorCode::PlanOwnershipViolation,
            Self::PlanAlreadyExecuted(_) => ErrorCode::PlanAlreadyExecuted,
            Self::ExecutionNotFound(_) => ErrorCode::ExecutionNotFound,
            Self::ExecutionAlreadyTerminal(_) => ErrorCode::ExecutionAlreadyTerminal,
            Self::AgentNotAvailable(_) => ErrorCode::AgentNotAvailable,
            Self::AgentTimeout(_) => ErrorCode::AgentTimeout,
            Self::AgentCrashed(_) => ErrorCode::AgentCrashed,
            Self::Workspace(_) => ErrorCode::WorkspaceError,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
