//! Long-lived agent subprocess supervision.
//!
//! One supervised child per execution. Children are spawned with
//! `kill_on_drop(true)`, a stripped environment, and piped stdio. Each
//! stream gets a dedicated reader task that frames output into events and
//! keeps the bounded ring buffer current; stdin writes go through one
//! writer task so approval records are never interleaved.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::{profile, AgentCatalog};
use super::output::OutputRing;
use super::plan_extract::{extract_plan, PlanExtract};
use super::{AgentKind, AgentState};
use crate::config::AgentsConfig;
use crate::protocol::StreamKind;
use crate::{AppError, Result};

/// Grace period between the polite signal and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variables the child inherits; everything else is stripped.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "TERM",
    "LANG",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
];

/// A framed event from a supervised child.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One line of stdout or stderr. Streams are per-stream FIFO and never
    /// merged; consumers interleave using `stream` and `ts`.
    Output {
        stream: StreamKind,
        data: String,
        ts: DateTime<Utc>,
    },
    /// The ring buffer evicted bytes; emitted once per overflow burst.
    Truncated { stream: StreamKind },
    /// The child exited.
    Exited { code: Option<i32> },
}

/// Control handle for a live child.
pub struct AgentHandle {
    /// Agent kind the child runs.
    pub kind: AgentKind,
    /// OS process id, when the child spawned successfully.
    pub pid: Option<u32>,
    stdin_tx: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    state: Arc<StdMutex<AgentState>>,
    stdout_ring: Arc<StdMutex<OutputRing>>,
    stderr_ring: Arc<StdMutex<OutputRing>>,
}

impl AgentHandle {
    /// Current lifecycle state of the child.
    #[must_use]
    pub fn state(&self) -> AgentState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: AgentState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
    }

    /// Write one record to the child's stdin (newline appended).
    ///
    /// # Errors
    ///
    /// Returns `AppError::AgentCrashed` when stdin has already closed.
    pub async fn write_stdin(&self, record: &str) -> Result<()> {
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| AppError::AgentCrashed("agent stdin is closed".into()))?;
        tx.send(record.to_owned())
            .await
            .map_err(|_| AppError::AgentCrashed("agent stdin is closed".into()))
    }

    /// Close the child's stdin by dropping the writer.
    pub fn close_stdin(&mut self) {
        self.stdin_tx = None;
    }

    /// Clone of the stdin channel, for callers that forward interactive
    /// input while the supervisor pumps events.
    #[must_use]
    pub fn stdin_sender(&self) -> Option<mpsc::Sender<String>> {
        self.stdin_tx.clone()
    }

    /// Request teardown: polite signal, five-second grace, hard kill.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the buffered stdout.
    #[must_use]
    pub fn stdout_snapshot(&self) -> String {
        self.stdout_ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .to_string_lossy()
    }

    /// Snapshot of the buffered stderr.
    #[must_use]
    pub fn stderr_snapshot(&self) -> String {
        self.stderr_ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .to_string_lossy()
    }
}

/// A spawned child: its control handle plus the event stream.
pub struct SpawnedAgent {
    /// Control handle.
    pub handle: AgentHandle,
    /// Framed output and lifecycle events.
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Result of a plan-mode run.
pub struct PlanOutcome {
    /// Full captured stdout transcript (ring-bounded).
    pub transcript: String,
    /// The recovered plan artifact.
    pub extract: PlanExtract,
    /// Whether the child is still alive awaiting an approval record.
    pub awaits_interactive_approval: bool,
    /// The live child, present exactly when `awaits_interactive_approval`.
    pub live: Option<SpawnedAgent>,
}

/// Spawns and supervises agent subprocesses.
pub struct AgentSupervisor {
    catalog: Arc<AgentCatalog>,
    config: AgentsConfig,
}

impl AgentSupervisor {
    /// Build a supervisor.
    #[must_use]
    pub fn new(catalog: Arc<AgentCatalog>, config: AgentsConfig) -> Self {
        Self { catalog, config }
    }

    /// Overall wall-clock budget for one agent run.
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout)
    }

    /// Spawn the agent in plan mode and pump its transcript until the plan
    /// is complete.
    ///
    /// Completion is explicit: either the child exits (one-shot planners)
    /// or the profile's approval prompt appears on stdout (interactive
    /// planners, which stay alive blocked on stdin).
    ///
    /// # Errors
    ///
    /// `AgentNotAvailable` when the binary cannot be located or spawned,
    /// `AgentCrashed` on nonzero exit during planning, `AgentTimeout` when
    /// the run budget elapses.
    pub async fn start_plan(
        &self,
        kind: AgentKind,
        prompt: &str,
        workdir: &Path,
    ) -> Result<PlanOutcome> {
        let prof = profile(kind);
        let mut args: Vec<String> = prof.plan_args.iter().map(ToString::to_string).collect();
        args.push(prompt.to_owned());

        let mut spawned = self.spawn(kind, &args, workdir, true).await?;
        spawned.handle.set_state(AgentState::Planning);
        let deadline = tokio::time::Instant::now() + self.run_timeout();

        let mut awaiting = false;
        loop {
            let event = tokio::select! {
                event = spawned.events.recv() => event,
                () = tokio::time::sleep_until(deadline) => {
                    spawned.handle.cancel();
                    return Err(AppError::AgentTimeout(format!(
                        "{kind} plan mode exceeded {:?}", self.run_timeout()
                    )));
                }
            };
            match event {
                Some(StreamEvent::Output { stream, data, .. }) => {
                    if stream == StreamKind::Stdout
                        && prof.awaits_interactive_approval()
                        && data.contains(prof.approval_prompt)
                    {
                        awaiting = true;
                        break;
                    }
                }
                Some(StreamEvent::Truncated { .. }) => {}
                Some(StreamEvent::Exited { code }) => {
                    if code != Some(0) {
                        let stderr = spawned.handle.stderr_snapshot();
                        return Err(AppError::AgentCrashed(format!(
                            "plan production failed (exit {code:?}): {}",
                            tail(&stderr, 400)
                        )));
                    }
                    break;
                }
                None => break,
            }
        }

        let transcript = spawned.handle.stdout_snapshot();
        let extract = extract_plan(&transcript, prof.plan_markers);
        if awaiting {
            spawned.handle.set_state(AgentState::AwaitingApproval);
        }
        debug!(kind = %kind, awaiting, "plan stream complete");

        Ok(PlanOutcome {
            transcript,
            extract,
            awaits_interactive_approval: awaiting,
            live: awaiting.then_some(spawned),
        })
    }

    /// Write the approval record to an interactive planner's stdin; the
    /// caller then streams execution output from the same child until exit.
    ///
    /// # Errors
    ///
    /// `AgentCrashed` when the child's stdin already closed.
    pub async fn approve_interactively(
        &self,
        agent: &AgentHandle,
        directive: Option<&str>,
    ) -> Result<()> {
        let prof = profile(agent.kind);
        let record = match directive {
            Some(extra) => format!("{} {extra}", prof.approval_record),
            None => prof.approval_record.to_owned(),
        };
        agent.write_stdin(&record).await?;
        agent.set_state(AgentState::Executing);
        Ok(())
    }

    /// Write a rejection record and feedback; the child may then produce a
    /// fresh plan stream.
    ///
    /// # Errors
    ///
    /// `AgentCrashed` when the child's stdin already closed.
    pub async fn reject(&self, agent: &AgentHandle, feedback: &str) -> Result<()> {
        let prof = profile(agent.kind);
        agent
            .write_stdin(&format!("{}{feedback}", prof.rejection_prefix))
            .await
    }

    /// Spawn the agent for direct execution: the prompt is written to
    /// stdin, stdin is closed, and the caller consumes events until exit.
    ///
    /// # Errors
    ///
    /// `AgentNotAvailable` on locate/spawn failure.
    pub async fn start_one_shot(
        &self,
        kind: AgentKind,
        prompt: &str,
        workdir: &Path,
        extra_args: &[String],
    ) -> Result<SpawnedAgent> {
        let prof = profile(kind);
        let mut args: Vec<String> = prof.one_shot_args.iter().map(ToString::to_string).collect();
        args.extend(extra_args.iter().cloned());

        let mut spawned = self.spawn(kind, &args, workdir, true).await?;
        spawned.handle.set_state(AgentState::Executing);
        spawned.handle.write_stdin(prompt).await?;
        spawned.handle.close_stdin();
        Ok(spawned)
    }

    async fn spawn(
        &self,
        kind: AgentKind,
        args: &[String],
        workdir: &Path,
        stdin_open: bool,
    ) -> Result<SpawnedAgent> {
        let descriptor = self.catalog.locate(kind).await?;

        let mut attempt = 0;
        loop {
            match self.try_spawn(kind, &descriptor.path, args, workdir, stdin_open) {
                Ok(spawned) => return Ok(spawned),
                Err(err) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!(kind = %kind, attempt, %err, "agent spawn failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_spawn(
        &self,
        kind: AgentKind,
        binary: &str,
        args: &[String],
        workdir: &Path,
        stdin_open: bool,
    ) -> Result<SpawnedAgent> {
        let mut cmd = Command::new(binary);
        cmd.args(args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.current_dir(workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::AgentNotAvailable(format!("failed to spawn {kind}: {err}")))?;
        let pid = child.id();
        info!(kind = %kind, ?pid, "agent spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::AgentNotAvailable("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::AgentNotAvailable("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::AgentNotAvailable("failed to capture agent stderr".into()))?;

        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(256);
        let cancel = CancellationToken::new();
        let state = Arc::new(StdMutex::new(AgentState::Idle));

        let stdout_ring = Arc::new(StdMutex::new(OutputRing::new(self.config.max_buffer_bytes)));
        let stderr_ring = Arc::new(StdMutex::new(OutputRing::new(self.config.max_buffer_bytes)));

        spawn_reader(
            StreamKind::Stdout,
            BufReader::new(stdout),
            event_tx.clone(),
            Arc::clone(&stdout_ring),
        );
        spawn_reader(
            StreamKind::Stderr,
            BufReader::new(stderr),
            event_tx.clone(),
            Arc::clone(&stderr_ring),
        );

        let stdin_tx = stdin_open.then(|| spawn_stdin_writer(stdin));
        spawn_exit_monitor(kind, child, event_tx, cancel.clone(), Arc::clone(&state));

        Ok(SpawnedAgent {
            handle: AgentHandle {
                kind,
                pid,
                stdin_tx,
                cancel,
                state,
                stdout_ring,
                stderr_ring,
            },
            events: event_rx,
        })
    }
}

/// One blocking reader task per stream: per-line buffering keeps frames
/// UTF-8 safe; ring bookkeeping and the truncation marker live here.
fn spawn_reader<R>(
    stream: StreamKind,
    mut reader: BufReader<R>,
    tx: mpsc::Sender<StreamEvent>,
    ring: Arc<StdMutex<OutputRing>>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let truncated = {
                        let mut guard = ring
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        guard.push(&buf)
                    };
                    if truncated && tx.send(StreamEvent::Truncated { stream }).await.is_err() {
                        break;
                    }
                    let data = String::from_utf8_lossy(&buf).into_owned();
                    let event = StreamEvent::Output {
                        stream,
                        data,
                        ts: Utc::now(),
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(?stream, %err, "agent stream read error");
                    break;
                }
            }
        }
    });
}

/// Dedicated stdin writer; serialises all records through one channel.
fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if stdin.write_all(record.as_bytes()).await.is_err() {
                break;
            }
            if stdin.write_all(b"\n").await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
        // Dropping stdin closes the pipe.
    });
    tx
}

/// Owns the child: reports exit, and on cancellation runs the polite
/// terminate / grace / hard-kill sequence.
fn spawn_exit_monitor(
    kind: AgentKind,
    mut child: Child,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    state: Arc<StdMutex<AgentState>>,
) {
    tokio::spawn(async move {
        let code = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(kind = %kind, %err, "error waiting for agent child");
                    None
                }
            },
            () = cancel.cancelled() => {
                terminate_politely(kind, &mut child).await
            }
        };
        *state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = AgentState::Exited;
        let _ = event_tx.send(StreamEvent::Exited { code }).await;
    });
}

/// Polite signal, five seconds of grace, then the hard kill.
async fn terminate_politely(kind: AgentKind, child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(kind = %kind, %err, "SIGTERM delivery failed");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!(kind = %kind, ?status, "agent exited after polite signal");
            status.code()
        }
        Ok(Err(err)) => {
            warn!(kind = %kind, %err, "error waiting for agent after polite signal");
            None
        }
        Err(_) => {
            warn!(kind = %kind, "agent ignored polite signal, killing");
            if let Err(err) = child.kill().await {
                warn!(kind = %kind, %err, "hard kill failed");
            }
            None
        }
    }
}

fn tail(text: &str, max: usize) -> &str {
    let len = text.len();
    if len <= max {
        text
    } else {
        let mut start = len - max;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        &text[start..]
    }
}
