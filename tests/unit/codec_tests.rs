//! Unit tests for envelope validation and signature verification.
//!
//! The timestamp boundaries are exact: a command at `now - commandTimeout`
//! or `now + clockSkewTolerance` is admitted; one millisecond past either
//! edge is rejected.

use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;

use prompt_dock::crypto::BridgeIdentity;
use prompt_dock::protocol::codec::{self, MessageCodec};
use prompt_dock::protocol::Envelope;
use prompt_dock::AppError;

const MAX_AGE_MS: u64 = 30_000;
const SKEW_MS: u64 = 5_000;

fn codec() -> MessageCodec {
    MessageCodec::new(MAX_AGE_MS, SKEW_MS)
}

fn envelope(kind: &str, timestamp: String) -> Envelope {
    Envelope {
        id: "m-1".into(),
        kind: kind.into(),
        data: Some(json!({ "workdir": "/tmp" })),
        timestamp,
        nonce: None,
        signature: Some("sig".into()),
    }
}

fn stamp(offset: Duration) -> String {
    (Utc::now() + offset).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[test]
fn empty_id_and_unknown_type_are_structural_faults() {
    let now = Utc::now();
    let mut missing_id = envelope("git-status", stamp(Duration::zero()));
    missing_id.id = String::new();
    assert!(matches!(
        codec().validate(&missing_id, now),
        Err(AppError::InvalidMessage(_))
    ));

    let unknown = envelope("make-coffee", stamp(Duration::zero()));
    assert!(matches!(
        codec().validate(&unknown, now),
        Err(AppError::InvalidMessage(_))
    ));
}

#[test]
fn timestamp_at_exactly_max_age_is_admitted() {
    let now = Utc::now();
    let ts = (now - Duration::milliseconds(MAX_AGE_MS as i64))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    codec()
        .validate(&envelope("git-status", ts), now)
        .expect("boundary timestamp must be admitted");
}

#[test]
fn timestamp_one_ms_past_max_age_is_expired() {
    let now = Utc::now();
    let ts = (now - Duration::milliseconds(MAX_AGE_MS as i64 + 1))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    assert!(matches!(
        codec().validate(&envelope("git-status", ts), now),
        Err(AppError::CommandExpired)
    ));
}

#[test]
fn timestamp_at_exactly_skew_tolerance_is_admitted() {
    let now = Utc::now();
    let ts = (now + Duration::milliseconds(SKEW_MS as i64))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    codec()
        .validate(&envelope("git-status", ts), now)
        .expect("future boundary must be admitted");
}

#[test]
fn timestamp_one_ms_past_skew_is_from_the_future() {
    let now = Utc::now();
    let ts = (now + Duration::milliseconds(SKEW_MS as i64 + 1))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    assert!(matches!(
        codec().validate(&envelope("git-status", ts), now),
        Err(AppError::CommandFromFuture)
    ));
}

#[test]
fn signature_required_for_everything_but_health_check() {
    let now = Utc::now();
    let mut unsigned = envelope("git-status", stamp(Duration::zero()));
    unsigned.signature = None;
    assert!(matches!(
        codec().validate(&unsigned, now),
        Err(AppError::MissingSignature)
    ));

    let mut health = envelope("health-check", stamp(Duration::zero()));
    health.signature = None;
    codec()
        .validate(&health, now)
        .expect("health-check may arrive unsigned");
}

#[test]
fn signed_payload_is_key_order_independent() {
    let ts = stamp(Duration::zero());
    let mut a = envelope("git-status", ts.clone());
    a.data = Some(serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap());
    let mut b = envelope("git-status", ts);
    b.data = Some(serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap());
    assert_eq!(codec::signed_payload(&a), codec::signed_payload(&b));
}

#[test]
fn verify_signature_roundtrip_and_tamper() {
    let temp = tempfile::tempdir().expect("tempdir");
    let client = BridgeIdentity::init(temp.path()).expect("client keypair");

    let mut env = envelope("git-status", stamp(Duration::zero()));
    let payload = codec::signed_payload(&env);
    env.signature = Some(client.sign(payload.as_bytes()).expect("sign"));

    codec()
        .verify_signature(&env, client.public_key_pem())
        .expect("genuine signature verifies");

    let mut tampered = env.clone();
    tampered.data = Some(json!({ "workdir": "/etc" }));
    assert!(matches!(
        codec().verify_signature(&tampered, client.public_key_pem()),
        Err(AppError::InvalidSignature)
    ));
}
