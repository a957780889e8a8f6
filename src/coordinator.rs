//! The execution coordinator: drives the plan → approve → execute state
//! machine and owns every agent subprocess.
//!
//! Per-session serialisation invariant: at most one execution per session
//! is in STARTING or RUNNING at any instant; further submissions join a
//! FIFO queue that drains in submission order. One execution's terminal
//! event is emitted before the next execution starts.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::supervisor::{AgentSupervisor, SpawnedAgent, StreamEvent};
use crate::agent::{AgentKind, AgentState};
use crate::audit::{AuditAction, AuditEntry, AuditLogger};
use crate::config::GitConfig;
use crate::plans::{Plan, PlanRegistry};
use crate::protocol::{BridgeEvent, PlanMetadata};
use crate::workspace::WorkspaceAdapter;
use crate::{AppError, Result};

/// Events fan out to connections tagged with the owning session.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// The outbound frame.
    pub event: BridgeEvent,
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    /// Whether the status admits no further transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// One concrete attempt to apply an approved plan.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Execution identifier.
    pub id: String,
    /// The approved plan being applied.
    pub plan_id: String,
    /// Owning session.
    pub session_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution left the queue.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last reported progress percentage.
    pub progress: u8,
    /// Files observed changing during the run.
    pub modified_files: BTreeSet<String>,
    /// Failure reason, when terminal and unsuccessful.
    pub error_reason: Option<String>,
    /// Working directory of the run.
    pub workdir: PathBuf,
}

struct SessionQueue {
    queue: VecDeque<String>,
    running: bool,
}

/// Coordinates executions across sessions.
pub struct ExecutionCoordinator {
    supervisor: Arc<AgentSupervisor>,
    plans: Arc<PlanRegistry>,
    workspace: Arc<dyn WorkspaceAdapter>,
    audit: Arc<dyn AuditLogger>,
    git: GitConfig,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    queues: Mutex<HashMap<String, SessionQueue>>,
    live_planners: AsyncMutex<HashMap<String, SpawnedAgent>>,
    stdin_senders: Mutex<HashMap<String, mpsc::Sender<String>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl ExecutionCoordinator {
    /// Build a coordinator.
    #[must_use]
    pub fn new(
        supervisor: Arc<AgentSupervisor>,
        plans: Arc<PlanRegistry>,
        workspace: Arc<dyn WorkspaceAdapter>,
        audit: Arc<dyn AuditLogger>,
        git: GitConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            supervisor,
            plans,
            workspace,
            audit,
            git,
            executions: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            live_planners: AsyncMutex::new(HashMap::new()),
            stdin_senders: Mutex::new(HashMap::new()),
            events_tx,
        })
    }

    /// Subscribe to the outbound event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Access the plan registry.
    #[must_use]
    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    fn emit(&self, session_id: &str, event: BridgeEvent) {
        let _ = self.events_tx.send(SessionEvent {
            session_id: session_id.to_owned(),
            event,
        });
    }

    fn audit_log(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.log_entry(entry) {
            warn!(%err, "audit append failed");
        }
    }

    // ── Planning ─────────────────────────────────────────────────────────────

    /// Run plan mode and register the resulting plan as PROPOSED.
    ///
    /// # Errors
    ///
    /// `AppError::Workspace` when the workdir is unusable, supervisor
    /// errors when the agent fails to plan.
    pub async fn submit_plan_request(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        workdir: &Path,
        agent_kind: AgentKind,
    ) -> Result<Plan> {
        validate_workdir(workdir)?;

        let status = {
            let workspace = Arc::clone(&self.workspace);
            let dir = workdir.to_path_buf();
            tokio::task::spawn_blocking(move || workspace.status(&dir))
                .await
                .map_err(|err| AppError::Internal(format!("status task panicked: {err}")))??
        };
        info!(
            session_id,
            branch = ?status.branch,
            dirty = status.is_dirty,
            "captured workspace status before planning"
        );

        if self.git.auto_snapshot {
            let workspace = Arc::clone(&self.workspace);
            let dir = workdir.to_path_buf();
            let snapshot = tokio::task::spawn_blocking(move || workspace.create_backup_snapshot(&dir))
                .await
                .map_err(|err| AppError::Internal(format!("snapshot task panicked: {err}")))??;
            if let Some(id) = snapshot {
                info!(session_id, snapshot = %id, "backup snapshot created");
            }
        }

        let outcome = self.supervisor.start_plan(agent_kind, prompt, workdir).await?;
        let plan_text = outcome.extract.plan_text();
        let hint = hint_modified_files(&plan_text, workdir);

        let plan = self.plans.create(
            session_id,
            prompt,
            workdir.to_path_buf(),
            agent_kind,
            plan_text,
            hint,
            outcome.awaits_interactive_approval,
        );

        if let Some(live) = outcome.live {
            self.live_planners
                .lock()
                .await
                .insert(plan.id.clone(), live);
        }

        self.audit_log(AuditEntry::new(AuditAction::PlanCreated).with_data(json!({
            "planId": plan.id,
            "sessionId": session_id,
            "agent": agent_kind.as_str(),
        })));
        Ok(plan)
    }

    /// Transition PROPOSED → APPROVED.
    ///
    /// # Errors
    ///
    /// Registry errors for unknown, foreign, or terminal plans.
    pub fn approve_plan(&self, session_id: &str, plan_id: &str) -> Result<Plan> {
        let plan = self.plans.approve(plan_id, session_id)?;
        self.audit_log(AuditEntry::new(AuditAction::PlanApproved).with_data(json!({
            "planId": plan_id,
            "sessionId": session_id,
        })));
        Ok(plan)
    }

    /// Transition PROPOSED → REJECTED; removes the plan and tears down any
    /// live planner after forwarding the feedback.
    ///
    /// # Errors
    ///
    /// Registry errors for unknown, foreign, or terminal plans.
    pub async fn reject_plan(
        &self,
        session_id: &str,
        plan_id: &str,
        reason: Option<&str>,
    ) -> Result<Plan> {
        let plan = self.plans.reject(plan_id, session_id, reason)?;

        if let Some(live) = self.live_planners.lock().await.remove(plan_id) {
            if let Err(err) = self
                .supervisor
                .reject(&live.handle, reason.unwrap_or("plan rejected"))
                .await
            {
                warn!(plan_id, %err, "failed to forward rejection to planner");
            }
            live.handle.cancel();
        }

        self.audit_log(AuditEntry::new(AuditAction::PlanRejected).with_data(json!({
            "planId": plan_id,
            "sessionId": session_id,
            "reason": reason,
        })));
        Ok(plan)
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Enqueue an execution of an APPROVED plan owned by the caller.
    ///
    /// Returns the execution id; `execution-started` is emitted when the
    /// task reaches the head of the session's queue.
    ///
    /// # Errors
    ///
    /// Registry errors when the plan is missing, foreign, or not approved.
    pub fn execute_plan(self: &Arc<Self>, session_id: &str, plan_id: &str) -> Result<String> {
        let plan = self.plans.require_approved(plan_id, session_id)?;

        let execution = ExecutionRecord {
            id: format!("e-{}", Uuid::new_v4()),
            plan_id: plan.id.clone(),
            session_id: session_id.to_owned(),
            status: ExecutionStatus::Queued,
            started_at: None,
            finished_at: None,
            progress: 0,
            modified_files: BTreeSet::new(),
            error_reason: None,
            workdir: plan.workdir.clone(),
        };
        let execution_id = execution.id.clone();

        self.executions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(execution_id.clone(), execution);
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(execution_id.clone(), CancellationToken::new());

        let start_drain = {
            let mut queues = self
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = queues.entry(session_id.to_owned()).or_insert(SessionQueue {
                queue: VecDeque::new(),
                running: false,
            });
            entry.queue.push_back(execution_id.clone());
            if entry.running {
                false
            } else {
                entry.running = true;
                true
            }
        };

        if start_drain {
            let this = Arc::clone(self);
            let session = session_id.to_owned();
            tokio::spawn(async move { this.drain_session_queue(&session).await });
        }

        Ok(execution_id)
    }

    async fn drain_session_queue(self: &Arc<Self>, session_id: &str) {
        loop {
            let next = {
                let mut queues = self
                    .queues
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let Some(entry) = queues.get_mut(session_id) else {
                    return;
                };
                match entry.queue.pop_front() {
                    Some(id) => id,
                    None => {
                        entry.running = false;
                        return;
                    }
                }
            };
            self.drive_execution(&next).await;
        }
    }

    async fn drive_execution(self: &Arc<Self>, execution_id: &str) {
        let Some((session_id, plan_id, workdir)) = self.with_execution(execution_id, |e| {
            (e.session_id.clone(), e.plan_id.clone(), e.workdir.clone())
        }) else {
            return;
        };

        // An abort can land while the task is still queued.
        let cancel = self.cancel_token(execution_id);
        if cancel.is_cancelled() {
            self.finish(execution_id, ExecutionStatus::Aborted, Some("aborted while queued".into()))
                .await;
            return;
        }

        self.set_status(execution_id, ExecutionStatus::Starting, 0);
        self.emit(
            &session_id,
            BridgeEvent::ExecutionStarted {
                execution_id: execution_id.to_owned(),
                plan_id: plan_id.clone(),
            },
        );
        self.progress(&session_id, execution_id, "starting", 0);
        self.audit_log(AuditEntry::new(AuditAction::ExecutionStarted).with_data(json!({
            "executionId": execution_id,
            "planId": plan_id,
            "sessionId": session_id,
        })));

        let Some(plan) = self.plans.get(&plan_id) else {
            self.finish(execution_id, ExecutionStatus::Failed, Some("plan vanished".into()))
                .await;
            return;
        };

        // Interactive planners are approved over stdin; one-shot agents are
        // respawned with the plan as context.
        let live = self.live_planners.lock().await.remove(&plan_id);
        let spawned = match live {
            Some(agent) => {
                match self
                    .supervisor
                    .approve_interactively(&agent.handle, None)
                    .await
                {
                    Ok(()) => Ok(agent),
                    Err(err) => Err(err),
                }
            }
            None => {
                let prompt = format!(
                    "Apply the following approved plan.\n\nPlan:\n{}\n\nOriginal request:\n{}",
                    plan.plan_text, plan.prompt
                );
                self.supervisor
                    .start_one_shot(plan.agent_kind, &prompt, &workdir, &[])
                    .await
            }
        };

        let mut spawned = match spawned {
            Ok(agent) => agent,
            Err(err) => {
                self.emit(&session_id, BridgeEvent::error(&err, None));
                self.finish(execution_id, ExecutionStatus::Failed, Some(err.to_string()))
                    .await;
                return;
            }
        };

        if let Some(tx) = spawned.handle.stdin_sender() {
            self.stdin_senders
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(execution_id.to_owned(), tx);
        }

        self.set_status(execution_id, ExecutionStatus::Running, 10);
        self.progress(&session_id, execution_id, "running", 10);
        self.emit(
            &session_id,
            BridgeEvent::AgentStateChange {
                execution_id: execution_id.to_owned(),
                state: spawned.handle.state().as_str().to_owned(),
            },
        );

        // Workspace watcher: file-changed events for the duration of the run.
        let (fs_tx, mut fs_rx) = mpsc::channel::<PathBuf>(64);
        let _watch = match self.workspace.watch_workspace(&workdir, fs_tx) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(execution_id, %err, "workspace watch unavailable");
                None
            }
        };

        let deadline = tokio::time::Instant::now() + self.supervisor.run_timeout();
        let exit_code = loop {
            tokio::select! {
                event = spawned.events.recv() => match event {
                    Some(StreamEvent::Output { stream, data, ts }) => {
                        self.emit(&session_id, BridgeEvent::AgentOutput {
                            execution_id: execution_id.to_owned(),
                            stream,
                            data,
                            ts,
                        });
                    }
                    Some(StreamEvent::Truncated { stream }) => {
                        self.emit(&session_id, BridgeEvent::AgentOutput {
                            execution_id: execution_id.to_owned(),
                            stream,
                            data: "[output truncated]\n".into(),
                            ts: Utc::now(),
                        });
                    }
                    Some(StreamEvent::Exited { code }) => break code,
                    None => break None,
                },
                Some(path) = fs_rx.recv() => {
                    let file = path
                        .strip_prefix(&workdir)
                        .unwrap_or(&path)
                        .display()
                        .to_string();
                    let fresh = self
                        .with_execution(execution_id, |e| e.modified_files.insert(file.clone()))
                        .unwrap_or(false);
                    if fresh {
                        self.emit(&session_id, BridgeEvent::FileChanged {
                            execution_id: execution_id.to_owned(),
                            file,
                        });
                    }
                }
                () = cancel.cancelled() => {
                    // Teardown runs in the exit monitor; keep consuming
                    // events until the child is really gone so the terminal
                    // event is deferred until actual exit.
                    spawned.handle.cancel();
                    let _ = wait_for_exit(&mut spawned).await;
                    self.audit_log(AuditEntry::new(AuditAction::AgentKilled).with_data(json!({
                        "executionId": execution_id,
                    })));
                    self.finish(execution_id, ExecutionStatus::Aborted, Some("aborted".into()))
                        .await;
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {
                    spawned.handle.cancel();
                    let _ = wait_for_exit(&mut spawned).await;
                    let err = AppError::AgentTimeout("execution exceeded agents.timeout".into());
                    self.emit(&session_id, BridgeEvent::error(&err, None));
                    self.finish(execution_id, ExecutionStatus::Failed, Some(err.to_string()))
                        .await;
                    return;
                }
            }
        };

        if cancel.is_cancelled() {
            self.finish(execution_id, ExecutionStatus::Aborted, Some("aborted".into()))
                .await;
            return;
        }

        if exit_code != Some(0) {
            let reason = format!("agent exited with {exit_code:?}");
            self.finish(execution_id, ExecutionStatus::Failed, Some(reason))
                .await;
            return;
        }

        self.set_status(execution_id, ExecutionStatus::Running, 80);
        self.progress(&session_id, execution_id, "finalizing", 80);

        if self.git.auto_commit {
            let workspace = Arc::clone(&self.workspace);
            let dir = workdir.clone();
            let message = format!("prompt-dock: {}", plan.prompt.chars().take(60).collect::<String>());
            let commit = tokio::task::spawn_blocking(move || workspace.commit(&dir, &message, &[]))
                .await;
            match commit {
                Ok(Ok(Some(oid))) => info!(execution_id, commit = %oid, "auto-commit created"),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(execution_id, %err, "auto-commit failed"),
                Err(err) => warn!(execution_id, %err, "auto-commit task panicked"),
            }
            self.set_status(execution_id, ExecutionStatus::Running, 90);
            self.progress(&session_id, execution_id, "committed", 90);
        }

        self.plans.mark_executed(&plan_id);
        self.finish(execution_id, ExecutionStatus::Completed, None).await;
    }

    /// Forward interactive input to the session's running execution.
    ///
    /// # Errors
    ///
    /// `ExecutionNotFound` when the session has no running execution,
    /// `AgentCrashed` when its stdin has closed.
    pub async fn interact(&self, session_id: &str, message: &str) -> Result<()> {
        let running = {
            let executions = self
                .executions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            executions
                .values()
                .find(|e| e.session_id == session_id && e.status == ExecutionStatus::Running)
                .map(|e| e.id.clone())
        }
        .ok_or_else(|| AppError::ExecutionNotFound("no running execution".into()))?;
        self.feedback(session_id, &running, message).await
    }

    /// Forward feedback to a specific execution's stdin.
    ///
    /// # Errors
    ///
    /// `ExecutionNotFound` for unknown or foreign executions,
    /// `AgentCrashed` when its stdin has closed.
    pub async fn feedback(
        &self,
        session_id: &str,
        execution_id: &str,
        message: &str,
    ) -> Result<()> {
        let owner = self
            .with_execution(execution_id, |e| e.session_id.clone())
            .ok_or_else(|| AppError::ExecutionNotFound(execution_id.to_owned()))?;
        if owner != session_id {
            return Err(AppError::ExecutionNotFound(execution_id.to_owned()));
        }
        let tx = self
            .stdin_senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| AppError::AgentCrashed("agent stdin is closed".into()))?;
        tx.send(message.to_owned())
            .await
            .map_err(|_| AppError::AgentCrashed("agent stdin is closed".into()))
    }

    /// Abort a non-terminal execution owned by the caller.
    ///
    /// The status flips to ABORTED immediately; the terminal event follows
    /// once the subprocess has actually exited.
    ///
    /// # Errors
    ///
    /// `ExecutionNotFound`, `ExecutionAlreadyTerminal`, or an ownership
    /// violation mapped onto `ExecutionNotFound` (foreign executions are
    /// not disclosed).
    pub fn abort(&self, session_id: &str, execution_id: &str) -> Result<()> {
        let owned = self
            .with_execution(execution_id, |e| {
                (e.session_id.clone(), e.status)
            })
            .ok_or_else(|| AppError::ExecutionNotFound(execution_id.to_owned()))?;
        if owned.0 != session_id {
            return Err(AppError::ExecutionNotFound(execution_id.to_owned()));
        }
        if owned.1.is_terminal() {
            return Err(AppError::ExecutionAlreadyTerminal(execution_id.to_owned()));
        }
        self.cancel_token(execution_id).cancel();
        Ok(())
    }

    /// Cancel whatever the session is currently running (connection close).
    pub fn cancel_session(&self, session_id: &str) {
        let active: Vec<String> = {
            let executions = self
                .executions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            executions
                .values()
                .filter(|e| e.session_id == session_id && !e.status.is_terminal())
                .map(|e| e.id.clone())
                .collect()
        };
        for id in active {
            self.cancel_token(&id).cancel();
        }
    }

    /// Cancel every live execution and flush every queue.
    ///
    /// Best-effort parallel: all children receive the polite signal
    /// concurrently and share the grace period. Returns the ids of the
    /// aborted executions.
    pub fn emergency_stop(&self, reason: &str) -> Vec<String> {
        let (live, queued): (Vec<String>, Vec<(String, String)>) = {
            let executions = self
                .executions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let live = executions
                .values()
                .filter(|e| {
                    matches!(e.status, ExecutionStatus::Starting | ExecutionStatus::Running)
                })
                .map(|e| e.id.clone())
                .collect();
            let queued = executions
                .values()
                .filter(|e| e.status == ExecutionStatus::Queued)
                .map(|e| (e.id.clone(), e.session_id.clone()))
                .collect();
            (live, queued)
        };

        for id in &live {
            self.cancel_token(id).cancel();
        }
        for (id, session_id) in &queued {
            self.cancel_token(id).cancel();
            self.set_status(id, ExecutionStatus::Aborted, 0);
            self.emit(
                session_id,
                BridgeEvent::ExecutionFailed {
                    execution_id: id.clone(),
                    error: reason.to_owned(),
                },
            );
        }
        {
            let mut queues = self
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for entry in queues.values_mut() {
                entry.queue.clear();
            }
        }

        live.into_iter().chain(queued.into_iter().map(|(id, _)| id)).collect()
    }

    /// Sweep expired plans; run by the periodic sweeper.
    pub fn sweep(&self) {
        for plan_id in self.plans.sweep() {
            info!(%plan_id, "unapproved plan expired");
        }
    }

    /// Look up an execution.
    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.with_execution(execution_id, |e| e.clone())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn with_execution<T>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionRecord) -> T,
    ) -> Option<T> {
        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        executions.get_mut(execution_id).map(f)
    }

    fn cancel_token(&self, execution_id: &str) -> CancellationToken {
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(execution_id.to_owned())
            .or_default()
            .clone()
    }

    fn set_status(&self, execution_id: &str, status: ExecutionStatus, progress: u8) {
        self.with_execution(execution_id, |e| {
            e.status = status;
            e.progress = progress;
            if status == ExecutionStatus::Starting {
                e.started_at = Some(Utc::now());
            }
        });
    }

    fn progress(&self, session_id: &str, execution_id: &str, status: &str, progress: u8) {
        self.with_execution(execution_id, |e| e.progress = progress);
        self.emit(
            session_id,
            BridgeEvent::ExecutionProgress {
                execution_id: execution_id.to_owned(),
                status: status.to_owned(),
                progress,
            },
        );
    }

    async fn finish(&self, execution_id: &str, status: ExecutionStatus, reason: Option<String>) {
        self.stdin_senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(execution_id);
        let Some((session_id, plan_id, modified)) = self.with_execution(execution_id, |e| {
            e.status = status;
            e.finished_at = Some(Utc::now());
            e.error_reason = reason.clone();
            if status == ExecutionStatus::Completed {
                e.progress = 100;
            }
            (
                e.session_id.clone(),
                e.plan_id.clone(),
                e.modified_files.iter().cloned().collect::<Vec<_>>(),
            )
        }) else {
            return;
        };

        match status {
            ExecutionStatus::Completed => {
                self.progress(&session_id, execution_id, "completed", 100);
                self.emit(
                    &session_id,
                    BridgeEvent::ExecutionComplete {
                        execution_id: execution_id.to_owned(),
                        plan_id,
                        modified_files: modified,
                        result: "success".into(),
                    },
                );
            }
            _ => {
                self.emit(
                    &session_id,
                    BridgeEvent::ExecutionFailed {
                        execution_id: execution_id.to_owned(),
                        error: reason.clone().unwrap_or_else(|| "failed".into()),
                    },
                );
            }
        }

        self.emit(
            &session_id,
            BridgeEvent::AgentStateChange {
                execution_id: execution_id.to_owned(),
                state: AgentState::Exited.as_str().to_owned(),
            },
        );

        self.audit_log(AuditEntry::new(AuditAction::ExecutionFinished).with_data(json!({
            "executionId": execution_id,
            "status": status.as_str(),
            "reason": reason,
        })));
    }
}

async fn wait_for_exit(spawned: &mut SpawnedAgent) -> Option<i32> {
    while let Some(event) = spawned.events.recv().await {
        if let StreamEvent::Exited { code } = event {
            return code;
        }
    }
    None
}

fn validate_workdir(workdir: &Path) -> Result<()> {
    let meta = std::fs::metadata(workdir)
        .map_err(|err| AppError::Workspace(format!("workdir {}: {err}", workdir.display())))?;
    if !meta.is_dir() {
        return Err(AppError::Workspace(format!(
            "workdir {} is not a directory",
            workdir.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(AppError::Workspace(format!(
            "workdir {} is not writable",
            workdir.display()
        )));
    }
    Ok(())
}

/// Best-effort list of files the plan mentions that exist in the workdir.
fn hint_modified_files(plan_text: &str, workdir: &Path) -> Vec<String> {
    let mut out = BTreeSet::new();
    for token in plan_text.split(|c: char| c.is_whitespace() || c == '`' || c == '(' || c == ')') {
        let token = token.trim_matches(|c: char| c == ',' || c == ':' || c == ';' || c == '.');
        if token.contains('/') || token.contains('.') {
            let candidate = workdir.join(token);
            if candidate.is_file() {
                out.insert(token.to_owned());
            }
        }
    }
    out.into_iter().collect()
}

/// Rough plan metadata derived from the plan text.
#[must_use]
pub fn plan_metadata(plan_text: &str) -> PlanMetadata {
    let steps = plan_text.lines().filter(|l| !l.trim().is_empty()).count();
    let complexity = if steps <= 4 {
        "low"
    } else if steps <= 12 {
        "medium"
    } else {
        "high"
    };
    let lowered = plan_text.to_lowercase();
    let risky = ["delete", "drop", "remove", "migrate", "rewrite"]
        .iter()
        .any(|kw| lowered.contains(kw));
    let risk_level = if risky { "high" } else { "low" };
    let estimated_duration = match complexity {
        "low" => "minutes",
        "medium" => "tens of minutes",
        _ => "an hour or more",
    };
    PlanMetadata {
        complexity: complexity.into(),
        risk_level: risk_level.into(),
        estimated_duration: estimated_duration.into(),
    }
}
