//! Daemon wiring: build the shared state, start both listeners and the
//! sweeper, and run until shutdown.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentCatalog, AgentSupervisor};
use crate::audit::JsonlAuditWriter;
use crate::config::{ensure_state_dir, BridgeConfig};
use crate::coordinator::ExecutionCoordinator;
use crate::crypto::BridgeIdentity;
use crate::pairing::PairingRegistry;
use crate::plans::PlanRegistry;
use crate::protocol::codec::MessageCodec;
use crate::server::{http, ws, AppState};
use crate::session::SessionStore;
use crate::workspace::GitWorkspace;
use crate::{AppError, Result};

/// Sweeper cadence for sessions, plans, and pairing codes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Path of the pidfile inside the state dir.
#[must_use]
pub fn pidfile_path(state_dir: &Path) -> PathBuf {
    state_dir.join("daemon.pid")
}

/// Path of the daemon log inside the state dir.
#[must_use]
pub fn logfile_path(state_dir: &Path) -> PathBuf {
    state_dir.join("daemon.log")
}

/// Assemble the shared state from configuration.
///
/// # Errors
///
/// Propagates identity, audit, or state-dir failures.
pub fn build_state(state_dir: &Path, config: BridgeConfig) -> Result<Arc<AppState>> {
    ensure_state_dir(state_dir)?;
    let identity = Arc::new(BridgeIdentity::init(state_dir)?);
    let audit: Arc<dyn crate::audit::AuditLogger> = Arc::new(JsonlAuditWriter::new(state_dir)?);

    let sessions = Arc::new(SessionStore::new(
        Arc::clone(&audit),
        config.security.session_timeout,
        config.security.max_commands_per_minute,
    ));
    let pairing = Arc::new(PairingRegistry::new());
    let catalog = Arc::new(AgentCatalog::new(config.agents.clone()));
    let supervisor = Arc::new(AgentSupervisor::new(
        Arc::clone(&catalog),
        config.agents.clone(),
    ));
    let workspace: Arc<dyn crate::workspace::WorkspaceAdapter> = Arc::new(GitWorkspace::new());
    let coordinator = ExecutionCoordinator::new(
        Arc::clone(&supervisor),
        Arc::new(PlanRegistry::new()),
        Arc::clone(&workspace),
        Arc::clone(&audit),
        config.git.clone(),
    );

    let codec = MessageCodec::new(
        config.security.command_timeout,
        config.security.clock_skew_tolerance,
    );
    let allowed_origins = config.effective_origins();

    Ok(Arc::new(AppState {
        config,
        allowed_origins,
        identity,
        pairing,
        sessions,
        codec,
        catalog,
        supervisor,
        coordinator,
        workspace,
        audit,
        started_at: Instant::now(),
    }))
}

/// Run the daemon until interrupted.
///
/// # Errors
///
/// Returns the first fatal startup error; runtime errors on one surface
/// bring the whole daemon down so systemd-style supervision can restart it.
pub async fn run(state_dir: &Path, config: BridgeConfig) -> Result<()> {
    let state = build_state(state_dir, config)?;
    let ct = CancellationToken::new();

    write_pidfile(state_dir)?;

    let sweeper = {
        let state = Arc::clone(&state);
        let ct = ct.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let expired = state.sessions.sweep();
                        for id in &expired {
                            state.coordinator.cancel_session(id);
                            state.coordinator.plans().drop_session(id);
                        }
                        state.coordinator.sweep();
                    }
                    () = ct.cancelled() => break,
                }
            }
        })
    };

    let http_task = tokio::spawn(http::serve(Arc::clone(&state), ct.clone()));
    let ws_task = tokio::spawn(ws::serve(Arc::clone(&state), ct.clone()));

    info!(
        port = state.config.port,
        ws_port = state.config.ws_port(),
        "prompt-dock bridge running"
    );
    if let Some(hub) = &state.config.hub {
        info!(hub, "hub announcement configured");
    }

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = flatten(http_task) => {
            error!("HTTP surface exited unexpectedly");
            cleanup(state_dir);
            return result;
        }
        result = flatten(ws_task) => {
            error!("message channel exited unexpectedly");
            cleanup(state_dir);
            return result;
        }
    }

    ct.cancel();
    state.coordinator.emergency_stop("daemon shutdown");
    let _ = sweeper.await;
    cleanup(state_dir);
    info!("prompt-dock bridge stopped");
    Ok(())
}

fn write_pidfile(state_dir: &Path) -> Result<()> {
    fs::write(pidfile_path(state_dir), std::process::id().to_string())?;
    Ok(())
}

fn cleanup(state_dir: &Path) {
    if let Err(err) = fs::remove_file(pidfile_path(state_dir)) {
        warn!(%err, "failed to remove pidfile");
    }
}

async fn flatten(task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(AppError::Internal(format!("listener task panicked: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}
