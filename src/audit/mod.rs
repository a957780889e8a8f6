//! Structured audit logging for security-relevant bridge events.
//!
//! Provides the [`AuditLogger`] trait and associated types. The primary
//! implementation, [`JsonlAuditWriter`], appends JSON-lines records to
//! `<state-dir>/audit.log`.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action classification for audit log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A pairing code was issued for an app.
    PairingCodeIssued,
    /// A pairing code was redeemed and a session minted.
    PairingCodeRedeemed,
    /// A session was created.
    SessionCreated,
    /// A session was revoked by the operator or client.
    SessionRevoked,
    /// A session expired and was swept.
    SessionExpired,
    /// A previously-seen command fingerprint was presented again.
    ReplayAttackDetected,
    /// A signature failed to verify for an otherwise well-formed envelope.
    SignatureRejected,
    /// All sessions were drained by the kill switch.
    EmergencyKillSwitch,
    /// A plan was created in the PROPOSED state.
    PlanCreated,
    /// A plan transitioned to APPROVED.
    PlanApproved,
    /// A plan was rejected and removed.
    PlanRejected,
    /// An execution left the queue and began running.
    ExecutionStarted,
    /// An execution reached a terminal state.
    ExecutionFinished,
    /// An agent subprocess was force-killed after the grace period.
    AgentKilled,
}

/// One audit record: `{timestamp, action, data}` on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub action: AuditAction,
    /// Free-form structured context for the event.
    pub data: serde_json::Value,
}

impl AuditEntry {
    /// Construct an entry with empty data.
    #[must_use]
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Attach structured context to this entry.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

/// An [`AuditLogger`] that drops every entry. Used by tests and by the
/// `config`/`test-agent` subcommands that never mutate state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log_entry(&self, _entry: AuditEntry) -> crate::Result<()> {
        Ok(())
    }
}

pub use writer::JsonlAuditWriter;
