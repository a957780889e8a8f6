//! The persistent bidirectional message channel.
//!
//! One WebSocket per client. The origin check is enforced before anything
//! else; disallowed peers are closed with the policy-violation code. All
//! outbound writes funnel through one mpsc writer task per connection, so
//! events reach the peer in the order they were emitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{self, ConnState};
use super::AppState;
use crate::protocol::{BridgeEvent, PROTOCOL_VERSION};
use crate::{AppError, Result};

/// Policy-violation close code.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A peer silent for two ping intervals is dead.
const PONG_DEADLINE: Duration = Duration::from_secs(70);

/// Serve the message channel until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` when the listener cannot bind.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.ws_port()));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind channel on {bind}: {err}")))?;
    info!(%bind, "message channel listening");

    let router = Router::new()
        .route("/", any(ws_handler))
        .route("/ws", any(ws_handler))
        .with_state(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Internal(format!("channel server error: {err}")))?;
    info!("message channel shut down");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    // The check is unconditional: a missing origin is as bad as a wrong one.
    let origin_ok = origin.as_deref().is_some_and(|o| state.origin_allowed(o));
    if !origin_ok {
        warn!(?origin, "channel connect from disallowed origin");
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, origin_ok))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, origin_ok: bool) {
    let (mut sink, mut stream) = socket.split();

    if !origin_ok {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "Origin not allowed".into(),
            })))
            .await;
        return;
    }

    let conn_id = Uuid::new_v4().to_string();
    debug!(conn_id, "channel connection accepted");

    // Single writer task: every outbound frame goes through this channel.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    dispatch::send_event(
        &out_tx,
        &BridgeEvent::Connected {
            version: PROTOCOL_VERSION.to_owned(),
        },
    )
    .await;

    let mut conn = ConnState::new(conn_id.clone());
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        dispatch::handle_envelope(&state, &mut conn, text.as_str(), &out_tx).await;
                        maybe_start_forwarder(&state, &conn, &out_tx, &mut forwarder);
                    }
                    Message::Ping(payload) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        debug!(conn_id, "ignoring binary frame");
                    }
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    warn!(conn_id, "peer unresponsive to pings, closing");
                    break;
                }
                if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Connection teardown: the session's running subprocess is cancelled;
    // plans and the session itself persist until their own expiry, so a
    // reconnect plus authenticate resumes where the client left off.
    if let Some(session) = &conn.session {
        state.coordinator.cancel_session(&session.id);
    }
    if let Some(task) = forwarder {
        task.abort();
    }
    writer.abort();
    debug!(conn_id, "channel connection closed");
}

/// Once the connection holds a session, bridge coordinator events for that
/// session into the connection's writer.
fn maybe_start_forwarder(
    state: &Arc<AppState>,
    conn: &ConnState,
    out_tx: &mpsc::Sender<Message>,
    forwarder: &mut Option<tokio::task::JoinHandle<()>>,
) {
    if forwarder.is_some() {
        return;
    }
    let Some(session) = &conn.session else { return };

    let session_id = session.id.clone();
    let mut events = state.coordinator.subscribe();
    let out = out_tx.clone();
    *forwarder = Some(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.session_id == session_id => {
                    dispatch::send_event(&out, &event.event).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(session_id, missed, "event forwarder lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }));
}
