//! Unit tests for wire-shape stability of envelopes and events.

use serde_json::{json, Value};

use prompt_dock::errors::ErrorCode;
use prompt_dock::protocol::{BridgeEvent, Envelope, StreamKind};

#[test]
fn envelope_roundtrips_with_optional_fields_absent() {
    let raw = r#"{
        "id": "m-1",
        "type": "health-check",
        "timestamp": "2026-08-02T12:00:00Z"
    }"#;
    let envelope: Envelope = serde_json::from_str(raw).expect("parse");
    assert_eq!(envelope.id, "m-1");
    assert_eq!(envelope.kind, "health-check");
    assert!(envelope.data.is_none());
    assert!(envelope.nonce.is_none());
    assert!(envelope.signature.is_none());

    let back = serde_json::to_value(&envelope).expect("serialise");
    assert_eq!(back.get("type").and_then(Value::as_str), Some("health-check"));
    assert!(back.get("signature").is_none(), "absent fields stay absent");
}

#[test]
fn events_use_kebab_case_type_tags_and_camel_case_fields() {
    let event = BridgeEvent::ExecutionComplete {
        execution_id: "e-1".into(),
        plan_id: "pl-1".into(),
        modified_files: vec!["src/main.rs".into()],
        result: "success".into(),
    };
    let value = serde_json::to_value(&event).expect("serialise");
    assert_eq!(
        value.get("type").and_then(Value::as_str),
        Some("execution-complete")
    );
    assert_eq!(
        value.get("executionId").and_then(Value::as_str),
        Some("e-1")
    );
    assert_eq!(value.get("planId").and_then(Value::as_str), Some("pl-1"));
}

#[test]
fn error_event_echoes_the_offending_id_and_short_code() {
    let err = prompt_dock::AppError::PlanNotFound("pl-NONE".into());
    let event = BridgeEvent::error(&err, Some("m-7".into()));
    let value = serde_json::to_value(&event).expect("serialise");
    assert_eq!(value.get("type").and_then(Value::as_str), Some("error"));
    assert_eq!(value.get("code").and_then(Value::as_str), Some("PLAN_NOT_FOUND"));
    assert_eq!(value.get("id").and_then(Value::as_str), Some("m-7"));
}

#[test]
fn error_codes_serialise_as_screaming_snake() {
    assert_eq!(
        serde_json::to_value(ErrorCode::RateLimitExceeded).expect("serialise"),
        json!("RATE_LIMIT_EXCEEDED")
    );
    assert_eq!(
        serde_json::to_value(ErrorCode::OriginNotAllowed).expect("serialise"),
        json!("ORIGIN_NOT_ALLOWED")
    );
}

#[test]
fn agent_output_carries_stream_tag_and_timestamp() {
    let event = BridgeEvent::AgentOutput {
        execution_id: "e-1".into(),
        stream: StreamKind::Stderr,
        data: "warning\n".into(),
        ts: chrono::Utc::now(),
    };
    let value = serde_json::to_value(&event).expect("serialise");
    assert_eq!(value.get("type").and_then(Value::as_str), Some("agent-output"));
    assert_eq!(value.get("stream").and_then(Value::as_str), Some("stderr"));
    assert!(value.get("ts").is_some());
}
