//! Integration tests for the message channel: origin policy, pairing,
//! authentication, signatures, and replay, all over a real WebSocket.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{ClientRequestBuilder, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use prompt_dock::crypto::BridgeIdentity;
use prompt_dock::pairing::RedemptionData;
use prompt_dock::protocol::codec;
use prompt_dock::protocol::Envelope;
use prompt_dock::server::{ws, AppState};

use super::test_helpers::{client_keypair, test_config, test_state, GOOD_ORIGIN};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_channel(state: Arc<AppState>) -> (u16, CancellationToken) {
    let port = state.config.ws_port();
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = ws::serve(state, server_ct).await;
    });

    // Wait until the listener accepts.
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return (port, ct);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("channel did not become ready");
}

async fn connect(port: u16, origin: &str) -> WsClient {
    let uri: tokio_tungstenite::tungstenite::http::Uri = format!("ws://127.0.0.1:{port}/")
        .parse()
        .expect("uri");
    let request = ClientRequestBuilder::new(uri).with_header("Origin", origin);
    let (socket, _response) = connect_async(request).await.expect("connect");
    socket
}

/// Read frames until a JSON text event arrives.
async fn next_event(socket: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("event within deadline")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Build a signed envelope as a wire-ready JSON string.
fn signed_envelope(client: &BridgeIdentity, id: &str, kind: &str, data: Value) -> String {
    let mut envelope = Envelope {
        id: id.to_owned(),
        kind: kind.to_owned(),
        data: Some(data),
        timestamp: Utc::now().to_rfc3339(),
        nonce: None,
        signature: None,
    };
    let payload = codec::signed_payload(&envelope);
    envelope.signature = Some(client.sign(payload.as_bytes()).expect("sign"));
    serde_json::to_string(&envelope).expect("serialise")
}

#[tokio::test]
async fn disallowed_origin_is_closed_with_policy_violation() {
    let (state, _guard) = test_state(test_config());
    let (port, _ct) = spawn_channel(state).await;

    let mut socket = connect(port, "https://evil.test").await;
    let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
        .await
        .expect("close within deadline")
        .expect("stream open")
        .expect("frame ok");

    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(close.reason.as_str(), "Origin not allowed");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn pairing_over_the_channel_mints_a_session() {
    let (client, _keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let code = state
        .pairing
        .issue("X", "https://x.test", state.identity.public_key_pem());
    let (port, _ct) = spawn_channel(Arc::clone(&state)).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    let greeting = next_event(&mut socket).await;
    assert_eq!(greeting.get("type").and_then(Value::as_str), Some("connected"));

    let frame = signed_envelope(
        &client,
        "m-pair",
        "pair",
        json!({ "code": code.code, "clientPublicKey": client.public_key_pem() }),
    );
    socket.send(Message::text(frame)).await.expect("send");

    let event = next_event(&mut socket).await;
    assert_eq!(
        event.get("type").and_then(Value::as_str),
        Some("pairing-success"),
        "got {event}"
    );
    assert!(event.get("sessionId").is_some());
    assert!(event.get("token").is_some());
    assert!(event.get("bridgePublicKey").is_some());
}

#[tokio::test]
async fn byte_identical_resend_is_rejected_as_replay() {
    let (client, _keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let code = state
        .pairing
        .issue("X", "https://x.test", state.identity.public_key_pem());
    let (port, _ct) = spawn_channel(Arc::clone(&state)).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    next_event(&mut socket).await; // connected

    let pair_frame = signed_envelope(
        &client,
        "m-pair",
        "pair",
        json!({ "code": code.code, "clientPublicKey": client.public_key_pem() }),
    );
    socket.send(Message::text(pair_frame)).await.expect("send");
    next_event(&mut socket).await; // pairing-success

    let check = signed_envelope(&client, "m-check", "health-check", json!({}));
    socket
        .send(Message::text(check.clone()))
        .await
        .expect("send first");
    let first = next_event(&mut socket).await;
    assert_eq!(first.get("type").and_then(Value::as_str), Some("connected"));

    // The captured envelope is resent byte-identically.
    socket.send(Message::text(check)).await.expect("send replay");
    let second = next_event(&mut socket).await;
    assert_eq!(second.get("type").and_then(Value::as_str), Some("error"));
    assert_eq!(
        second.get("code").and_then(Value::as_str),
        Some("REPLAY_DETECTED"),
        "got {second}"
    );
    assert_eq!(
        second.get("id").and_then(Value::as_str),
        Some("m-check"),
        "error echoes the offending id"
    );
}

#[tokio::test]
async fn authenticate_resumes_a_paired_session() {
    let (client, _keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let session = state
        .sessions
        .create(&RedemptionData {
            app_name: "X".into(),
            app_url: "https://x.test".into(),
            client_public_key: client.public_key_pem().to_owned(),
        })
        .expect("session");
    let (port, _ct) = spawn_channel(Arc::clone(&state)).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    next_event(&mut socket).await; // connected

    let frame = signed_envelope(
        &client,
        "m-auth",
        "authenticate",
        json!({ "token": session.token }),
    );
    socket.send(Message::text(frame)).await.expect("send");

    let event = next_event(&mut socket).await;
    assert_eq!(
        event.get("type").and_then(Value::as_str),
        Some("auth-success"),
        "got {event}"
    );
    assert_eq!(
        event.get("sessionId").and_then(Value::as_str),
        Some(session.id.as_str())
    );
    assert!(event.get("token").is_some(), "latest token is relayed");

    let agents = next_event(&mut socket).await;
    assert_eq!(
        agents.get("type").and_then(Value::as_str),
        Some("agents-available")
    );
}

#[tokio::test]
async fn wrong_key_signature_is_rejected() {
    let (client, _keys) = client_keypair();
    let (imposter, _imposter_keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let session = state
        .sessions
        .create(&RedemptionData {
            app_name: "X".into(),
            app_url: "https://x.test".into(),
            client_public_key: client.public_key_pem().to_owned(),
        })
        .expect("session");
    let (port, _ct) = spawn_channel(Arc::clone(&state)).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    next_event(&mut socket).await; // connected

    let frame = signed_envelope(
        &imposter,
        "m-auth",
        "authenticate",
        json!({ "token": session.token }),
    );
    socket.send(Message::text(frame)).await.expect("send");

    let event = next_event(&mut socket).await;
    assert_eq!(event.get("type").and_then(Value::as_str), Some("error"));
    assert_eq!(
        event.get("code").and_then(Value::as_str),
        Some("INVALID_SIGNATURE")
    );
}

#[tokio::test]
async fn execute_without_a_plan_is_refused_and_state_survives() {
    let (client, _keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let code = state
        .pairing
        .issue("X", "https://x.test", state.identity.public_key_pem());
    let (port, _ct) = spawn_channel(Arc::clone(&state)).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    next_event(&mut socket).await; // connected

    let pair_frame = signed_envelope(
        &client,
        "m-pair",
        "pair",
        json!({ "code": code.code, "clientPublicKey": client.public_key_pem() }),
    );
    socket.send(Message::text(pair_frame)).await.expect("send");
    next_event(&mut socket).await; // pairing-success

    let bypass = signed_envelope(
        &client,
        "m-exec",
        "execute-prompt",
        json!({ "prompt": "P", "mode": "execute", "options": { "planId": "pl-NONE" } }),
    );
    socket.send(Message::text(bypass)).await.expect("send");

    let event = next_event(&mut socket).await;
    assert_eq!(event.get("type").and_then(Value::as_str), Some("error"));
    assert_eq!(
        event.get("code").and_then(Value::as_str),
        Some("PLAN_NOT_FOUND"),
        "got {event}"
    );

    // The session is unharmed: a follow-up command is still admitted.
    let check = signed_envelope(&client, "m-after", "health-check", json!({}));
    socket.send(Message::text(check)).await.expect("send");
    let after = next_event(&mut socket).await;
    assert_eq!(after.get("type").and_then(Value::as_str), Some("connected"));
}

#[tokio::test]
async fn commands_without_a_session_are_refused() {
    let (client, _keys) = client_keypair();
    let (state, _guard) = test_state(test_config());
    let (port, _ct) = spawn_channel(state).await;

    let mut socket = connect(port, GOOD_ORIGIN).await;
    next_event(&mut socket).await; // connected

    let frame = signed_envelope(&client, "m-1", "git-status", json!({ "workdir": "/tmp" }));
    socket.send(Message::text(frame)).await.expect("send");

    let event = next_event(&mut socket).await;
    assert_eq!(event.get("type").and_then(Value::as_str), Some("error"));
    assert_eq!(
        event.get("code").and_then(Value::as_str),
        Some("NOT_AUTHENTICATED")
    );
}
