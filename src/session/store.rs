//! The session store: token issuance and rotation, command admission,
//! revocation, and expiry sweeping.
//!
//! The store is the only component that mutates session fields. All
//! mutations happen under one mutex, so per-session state transitions are
//! serialised; no callback ever runs while the lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::rate_limit::{RateDecision, RateLimitState};
use super::{Session, SessionSnapshot};
use crate::audit::{AuditAction, AuditEntry, AuditLogger};
use crate::crypto::TokenSigner;
use crate::pairing::RedemptionData;
use crate::{AppError, Result};

/// Token refresh threshold cap: fifteen minutes.
const REFRESH_CAP_SECS: i64 = 15 * 60;

/// Outcome of [`SessionStore::admit_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Command admitted; the caller may dispatch it.
    Admit {
        /// Latest token if admission rotated it, to be relayed to the client.
        rotated_token: Option<String>,
    },
    /// Command rejected.
    Reject(RejectReason),
}

/// Why a command was refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Rate limiter back-off in force; seconds remaining.
    RateLimited(u64),
    /// Fingerprint already admitted in this session.
    Replay,
}

/// In-memory store of authenticated sessions.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    signer: TokenSigner,
    audit: Arc<dyn AuditLogger>,
    session_timeout: Duration,
    refresh_threshold: Duration,
    max_commands_per_minute: u32,
}

impl SessionStore {
    /// Build a store.
    ///
    /// `session_timeout_ms` is the sliding-window lifetime; the token
    /// refresh threshold derives from it as `min(timeout / 2, 15 min)`.
    #[must_use]
    pub fn new(
        audit: Arc<dyn AuditLogger>,
        session_timeout_ms: u64,
        max_commands_per_minute: u32,
    ) -> Self {
        let session_timeout = Duration::milliseconds(session_timeout_ms as i64);
        Self {
            sessions: Mutex::new(HashMap::new()),
            signer: TokenSigner::new(),
            audit,
            session_timeout,
            refresh_threshold: std::cmp::min(
                session_timeout / 2,
                Duration::seconds(REFRESH_CAP_SECS),
            ),
            max_commands_per_minute,
        }
    }

    /// Shrink the token refresh threshold so rotation paths are reachable
    /// without waiting out the real window.
    #[cfg(test)]
    pub(crate) fn set_refresh_threshold(&mut self, threshold: Duration) {
        self.refresh_threshold = threshold;
    }

    /// Create a session from a successful pairing redemption.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if token issuance fails.
    pub fn create(&self, redemption: &RedemptionData) -> Result<SessionSnapshot> {
        let now = Utc::now();
        let id = new_session_id();
        let token = self
            .signer
            .issue(&id, &redemption.app_name, &redemption.app_url)?;

        let session = Session {
            id: id.clone(),
            app_name: redemption.app_name.clone(),
            app_url: redemption.app_url.clone(),
            client_public_key: redemption.client_public_key.clone(),
            created_at: now,
            expires_at: now + self.session_timeout,
            last_activity: now,
            token: token.clone(),
            token_issued_at: now,
            executed_fingerprints: HashSet::new(),
            rate: RateLimitState::new(now),
            pending_command_count: 0,
            recent_commands: VecDeque::new(),
        };
        let snapshot = snapshot_of(&session, false);

        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone(), session);

        self.audit(
            AuditEntry::new(AuditAction::SessionCreated).with_data(json!({
                "sessionId": id,
                "appName": redemption.app_name,
            })),
        );
        info!(session_id = %id, app_name = %redemption.app_name, "session created");
        Ok(snapshot)
    }

    /// Resolve a session by bearer token.
    ///
    /// On success bumps `last_activity`, slides `expires_at`, and rotates
    /// the token when the refresh threshold has elapsed. The returned
    /// snapshot always carries the latest token; when `token_rotated` is
    /// set the caller must relay it to the client.
    ///
    /// # Errors
    ///
    /// `AppError::SessionExpired` if the token or session has expired, or
    /// if the session no longer exists; `AppError::InvalidSignature` if the
    /// token fails validation or is not the session's current token.
    pub fn resolve_by_token(&self, token: &str) -> Result<SessionSnapshot> {
        let claims = self.signer.decode(token)?;
        let now = Utc::now();

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions
            .get_mut(&claims.session_id)
            .ok_or(AppError::SessionExpired)?;

        // A rotated-out token decodes fine but no longer matches.
        if session.token != token {
            return Err(AppError::InvalidSignature);
        }
        if session.expires_at < now {
            return Err(AppError::SessionExpired);
        }

        session.last_activity = now;
        session.expires_at = now + self.session_timeout;

        let mut rotated = false;
        if now - session.token_issued_at >= self.refresh_threshold {
            session.token = self
                .signer
                .issue(&session.id, &session.app_name, &session.app_url)?;
            session.token_issued_at = now;
            rotated = true;
        }

        Ok(snapshot_of(session, rotated))
    }

    /// Resolve the client public key bound to a token's session, without
    /// mutating any session state. Used for signature verification before
    /// the token itself is honoured.
    ///
    /// # Errors
    ///
    /// Token decode errors, or `AppError::SessionExpired` when the session
    /// no longer exists.
    pub fn client_key_for_token(&self, token: &str) -> Result<(String, String)> {
        let claims = self.signer.decode(token)?;
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions
            .get(&claims.session_id)
            .ok_or(AppError::SessionExpired)?;
        Ok((session.id.clone(), session.client_public_key.clone()))
    }

    /// One atomic admission decision for a command.
    ///
    /// Evaluation order: rate limit, then replay, then admit. `payload_canonical`
    /// is the canonical form of the envelope's `data`.
    ///
    /// # Errors
    ///
    /// `AppError::SessionExpired` if the session no longer exists.
    pub fn admit_command(
        &self,
        session_id: &str,
        command_id: &str,
        type_tag: &str,
        payload_canonical: &str,
    ) -> Result<Admission> {
        let now = Utc::now();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions
            .get_mut(session_id)
            .ok_or(AppError::SessionExpired)?;

        match session.rate.check(now, self.max_commands_per_minute) {
            RateDecision::Limited { retry_after_secs } => {
                return Ok(Admission::Reject(RejectReason::RateLimited(
                    retry_after_secs,
                )));
            }
            RateDecision::Admitted => {}
        }

        let fingerprint = command_fingerprint(command_id, payload_canonical);
        if session.executed_fingerprints.contains(&fingerprint) {
            self.audit(
                AuditEntry::new(AuditAction::ReplayAttackDetected).with_data(json!({
                    "sessionId": session_id,
                    "commandId": command_id,
                    "commandType": type_tag,
                })),
            );
            warn!(session_id, command_id, "replayed command rejected");
            return Ok(Admission::Reject(RejectReason::Replay));
        }

        session.executed_fingerprints.insert(fingerprint);
        session.pending_command_count += 1;
        session.push_recent(type_tag);
        session.last_activity = now;
        session.expires_at = now + self.session_timeout;

        // Admission is also token-refresh ground: a long-lived connection
        // that never re-authenticates still gets its token rotated.
        let mut rotated_token = None;
        if now - session.token_issued_at >= self.refresh_threshold {
            let token = self
                .signer
                .issue(&session.id, &session.app_name, &session.app_url)?;
            session.token = token.clone();
            session.token_issued_at = now;
            rotated_token = Some(token);
        }

        Ok(Admission::Admit { rotated_token })
    }

    /// Mark one pending command as finished.
    pub fn command_finished(&self, session_id: &str) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(session_id) {
            session.pending_command_count = session.pending_command_count.saturating_sub(1);
        }
    }

    /// Look up a session without mutating it.
    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.get(session_id).map(|s| snapshot_of(s, false))
    }

    /// Enumerate sessions for the control surface.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.values().map(|s| snapshot_of(s, false)).collect()
    }

    /// Remove a session and its replay cache.
    ///
    /// Returns whether a session was actually removed.
    pub fn revoke(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id)
            .is_some();
        if removed {
            self.audit(
                AuditEntry::new(AuditAction::SessionRevoked)
                    .with_data(json!({ "sessionId": session_id })),
            );
            info!(session_id, "session revoked");
        }
        removed
    }

    /// Atomically drain every session.
    ///
    /// Returns the ids of the terminated sessions; an empty store yields an
    /// empty list, not an error.
    pub fn emergency_kill(&self, reason: &str) -> Vec<String> {
        let drained: Vec<String> = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sessions.drain().map(|(id, _)| id).collect()
        };
        self.audit(
            AuditEntry::new(AuditAction::EmergencyKillSwitch).with_data(json!({
                "reason": reason,
                "terminatedSessions": drained,
            })),
        );
        warn!(count = drained.len(), reason, "emergency kill switch engaged");
        drained
    }

    /// Expire sessions whose `expires_at` has passed. Run by the periodic
    /// sweeper.
    ///
    /// Returns the ids of the expired sessions.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.expires_at < now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };
        for id in &expired {
            self.audit(
                AuditEntry::new(AuditAction::SessionExpired).with_data(json!({ "sessionId": id })),
            );
        }
        expired
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.log_entry(entry) {
            warn!(%err, "audit append failed");
        }
    }
}

/// Fingerprint used by the replay cache: SHA-256 over the command id
/// concatenated with the canonical payload.
#[must_use]
pub fn command_fingerprint(command_id: &str, payload_canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_id.as_bytes());
    hasher.update(payload_canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// 128-bit random session identifier, 32 lowercase hex characters.
fn new_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn snapshot_of(session: &Session, token_rotated: bool) -> SessionSnapshot {
    SessionSnapshot {
        id: session.id.clone(),
        app_name: session.app_name.clone(),
        app_url: session.app_url.clone(),
        client_public_key: session.client_public_key.clone(),
        created_at: session.created_at,
        expires_at: session.expires_at,
        last_activity: session.last_activity,
        token: session.token.clone(),
        token_rotated,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::NullAuditLogger;

    fn redemption() -> RedemptionData {
        RedemptionData {
            app_name: "App".into(),
            app_url: "https://app.test".into(),
            client_public_key: "CLIENT-PEM".into(),
        }
    }

    fn store_with_instant_rotation() -> SessionStore {
        let mut store = SessionStore::new(Arc::new(NullAuditLogger), 120_000, 100);
        store.set_refresh_threshold(Duration::zero());
        store
    }

    #[test]
    fn rotation_invalidates_the_old_token_immediately() {
        let store = store_with_instant_rotation();
        let created = store.create(&redemption()).expect("create");

        let resolved = store.resolve_by_token(&created.token).expect("resolve");
        assert!(resolved.token_rotated, "threshold zero forces rotation");
        assert_ne!(resolved.token, created.token);

        // At most one token validates per session at any instant.
        assert!(matches!(
            store.resolve_by_token(&created.token),
            Err(AppError::InvalidSignature)
        ));
        store
            .resolve_by_token(&resolved.token)
            .expect("latest token validates");
    }

    #[test]
    fn admission_rotation_hands_the_new_token_to_the_caller() {
        let store = store_with_instant_rotation();
        let created = store.create(&redemption()).expect("create");

        let admission = store
            .admit_command(&created.id, "cmd-1", "git-status", "{}")
            .expect("admit");
        let Admission::Admit { rotated_token } = admission else {
            panic!("first command must be admitted");
        };
        let new_token = rotated_token.expect("admission past the threshold rotates");

        assert!(matches!(
            store.resolve_by_token(&created.token),
            Err(AppError::InvalidSignature)
        ));
        store
            .resolve_by_token(&new_token)
            .expect("relayed token validates");
    }
}
