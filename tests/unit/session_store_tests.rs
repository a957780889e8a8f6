//! Unit tests for the session store: admission, replay, revocation, and
//! the kill switch.

use std::sync::{Arc, Mutex};

use prompt_dock::audit::{AuditAction, AuditEntry, AuditLogger, NullAuditLogger};
use prompt_dock::pairing::RedemptionData;
use prompt_dock::session::store::{Admission, RejectReason};
use prompt_dock::session::SessionStore;
use prompt_dock::AppError;

/// Captures entries so tests can assert on the audit trail.
#[derive(Default)]
struct RecordingLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger for RecordingLogger {
    fn log_entry(&self, entry: AuditEntry) -> prompt_dock::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

impl RecordingLogger {
    fn actions(&self) -> Vec<AuditAction> {
        self.entries.lock().unwrap().iter().map(|e| e.action).collect()
    }
}

fn redemption() -> RedemptionData {
    RedemptionData {
        app_name: "App".into(),
        app_url: "https://app.test".into(),
        client_public_key: "CLIENT-PEM".into(),
    }
}

fn store() -> SessionStore {
    SessionStore::new(Arc::new(NullAuditLogger), 30 * 60 * 1000, 100)
}

#[test]
fn create_then_resolve_returns_the_same_session() {
    let store = store();
    let created = store.create(&redemption()).expect("create");
    assert_eq!(created.id.len(), 32, "128-bit hex id");

    let resolved = store.resolve_by_token(&created.token).expect("resolve");
    assert_eq!(resolved.id, created.id);
    assert!(!resolved.token_rotated, "fresh token needs no rotation");
    assert_eq!(resolved.token, created.token);
}

#[test]
fn resolve_slides_the_expiry_window() {
    let store = store();
    let created = store.create(&redemption()).expect("create");
    let resolved = store.resolve_by_token(&created.token).expect("resolve");
    assert!(resolved.expires_at >= created.expires_at);
}

#[test]
fn garbage_tokens_are_rejected() {
    let store = store();
    assert!(store.resolve_by_token("not-a-token").is_err());
    assert!(store.resolve_by_token("a.b").is_err());
}

#[test]
fn identical_command_is_rejected_as_replay_and_audited() {
    let audit = Arc::new(RecordingLogger::default());
    let store = SessionStore::new(Arc::clone(&audit) as Arc<dyn AuditLogger>, 60_000, 100);
    let session = store.create(&redemption()).expect("create");

    let first = store
        .admit_command(&session.id, "cmd-1", "git-status", r#"{"workdir":"/tmp"}"#)
        .expect("admit");
    assert!(matches!(first, Admission::Admit { .. }));

    let second = store
        .admit_command(&session.id, "cmd-1", "git-status", r#"{"workdir":"/tmp"}"#)
        .expect("decision");
    assert_eq!(second, Admission::Reject(RejectReason::Replay));

    assert!(
        audit.actions().contains(&AuditAction::ReplayAttackDetected),
        "replay must leave an audit entry"
    );
}

#[test]
fn same_id_with_different_payload_is_not_a_replay() {
    let store = store();
    let session = store.create(&redemption()).expect("create");

    store
        .admit_command(&session.id, "cmd-1", "git-status", r#"{"workdir":"/a"}"#)
        .expect("admit");
    let second = store
        .admit_command(&session.id, "cmd-1", "git-status", r#"{"workdir":"/b"}"#)
        .expect("decision");
    assert!(
        matches!(second, Admission::Admit { .. }),
        "fingerprint covers the payload, not just the id"
    );
}

#[test]
fn admission_honours_the_rate_ceiling() {
    let store = SessionStore::new(Arc::new(NullAuditLogger), 60_000, 3);
    let session = store.create(&redemption()).expect("create");

    for i in 0..3 {
        let admission = store
            .admit_command(&session.id, &format!("cmd-{i}"), "health-check", "{}")
            .expect("admit");
        assert!(matches!(admission, Admission::Admit { .. }), "command {i}");
    }
    let fourth = store
        .admit_command(&session.id, "cmd-3", "health-check", "{}")
        .expect("decision");
    assert!(matches!(
        fourth,
        Admission::Reject(RejectReason::RateLimited(_))
    ));
}

#[test]
fn revoke_removes_the_session_and_its_replay_cache() {
    let store = store();
    let session = store.create(&redemption()).expect("create");

    assert!(store.revoke(&session.id));
    assert!(!store.revoke(&session.id), "second revoke finds nothing");
    assert!(store.resolve_by_token(&session.token).is_err());
    assert!(matches!(
        store.admit_command(&session.id, "cmd-1", "git-status", "{}"),
        Err(AppError::SessionExpired)
    ));
}

#[test]
fn emergency_kill_with_no_sessions_returns_an_empty_list() {
    let store = store();
    assert!(store.emergency_kill("drill").is_empty());
}

#[test]
fn emergency_kill_drains_every_session() {
    let store = store();
    let a = store.create(&redemption()).expect("a");
    let b = store.create(&redemption()).expect("b");

    let mut terminated = store.emergency_kill("compromised");
    terminated.sort();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(terminated, expected);
    assert!(store.is_empty());
}

#[test]
fn sweep_leaves_live_sessions_alone() {
    let store = store();
    let session = store.create(&redemption()).expect("create");
    assert!(store.sweep().is_empty());
    assert!(store.get(&session.id).is_some());
}
