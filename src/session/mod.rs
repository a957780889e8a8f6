//! Authenticated sessions: model, rate limiting, and the store.

pub mod rate_limit;
pub mod store;

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use self::rate_limit::RateLimitState;

/// Upper bound on the recent-command history kept for observability.
const RECENT_COMMAND_HISTORY: usize = 100;

/// Server-side record of an authenticated remote app.
#[derive(Debug, Clone)]
pub struct Session {
    /// 128-bit random identifier.
    pub id: String,
    /// Paired application name.
    pub app_name: String,
    /// Paired application URL.
    pub app_url: String,
    /// Client public key (PEM) bound at pairing time.
    pub client_public_key: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Sliding-window expiry; every successful admission extends it.
    pub expires_at: DateTime<Utc>,
    /// Last successful token resolution or admission.
    pub last_activity: DateTime<Utc>,
    /// Current bearer token. At most one token validates per session.
    pub token: String,
    /// Issuance instant of the current token.
    pub token_issued_at: DateTime<Utc>,
    /// Fingerprints of every admitted command (replay cache).
    pub executed_fingerprints: HashSet<String>,
    /// Rate limiter state.
    pub rate: RateLimitState,
    /// Commands admitted but not yet completed by the coordinator.
    pub pending_command_count: u32,
    /// Recent command type tags, bounded, for observability only.
    pub recent_commands: VecDeque<String>,
}

impl Session {
    /// Record a command tag in the bounded history.
    pub fn push_recent(&mut self, type_tag: &str) {
        if self.recent_commands.len() == RECENT_COMMAND_HISTORY {
            self.recent_commands.pop_front();
        }
        self.recent_commands.push_back(type_tag.to_owned());
    }
}

/// Immutable view of a session handed out by the store.
///
/// Carries the *latest* token; callers that resolved a rotated session must
/// relay the new token back to the client.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub id: String,
    /// Paired application name.
    pub app_name: String,
    /// Paired application URL.
    pub app_url: String,
    /// Client public key (PEM).
    pub client_public_key: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Current expiry.
    pub expires_at: DateTime<Utc>,
    /// Last activity instant.
    pub last_activity: DateTime<Utc>,
    /// Latest bearer token.
    pub token: String,
    /// Whether the resolution that produced this snapshot rotated the token.
    pub token_rotated: bool,
}

pub use store::SessionStore;
