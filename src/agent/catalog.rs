//! Agent binary discovery and per-kind CLI profiles.
//!
//! A profile hides the CLI variants of each backing agent: how to ask for
//! a plan, how to execute directly, and which stdin records communicate
//! approval or rejection. Resolution order for the binary: the
//! user-configured path, then a short list of well-known locations, then
//! the process search path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::plan_extract::PlanMarker;
use super::AgentKind;
use crate::config::AgentsConfig;
use crate::protocol::AgentDescriptor;
use crate::{AppError, Result};

/// How long `--version` probing may take.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Static CLI profile for one agent kind.
pub struct AgentProfile {
    /// Which agent this profile drives.
    pub kind: AgentKind,
    /// Binary base name searched on the path.
    pub binary: &'static str,
    /// Arguments that put the agent in plan mode. The prompt follows.
    pub plan_args: &'static [&'static str],
    /// Arguments for direct one-shot execution. The prompt goes to stdin.
    pub one_shot_args: &'static [&'static str],
    /// Record written to stdin to approve a pending plan.
    pub approval_record: &'static str,
    /// Prefix written before feedback when rejecting a pending plan.
    pub rejection_prefix: &'static str,
    /// Marker pairs delimiting a plan block in the transcript.
    pub plan_markers: &'static [PlanMarker],
    /// Stdout line prefix signalling the agent is waiting for approval.
    /// Empty for agents whose plan mode exits after printing the plan.
    pub approval_prompt: &'static str,
    /// Whether the integration is marked beta.
    pub beta: bool,
}

impl AgentProfile {
    /// Whether plan mode keeps the child alive for interactive approval.
    #[must_use]
    pub fn awaits_interactive_approval(&self) -> bool {
        !self.approval_prompt.is_empty()
    }
}

const CLAUDE_MARKERS: &[PlanMarker] = &[
    PlanMarker {
        begin: "=== PLAN ===",
        end: "=== END PLAN ===",
    },
    PlanMarker {
        begin: "## Plan",
        end: "",
    },
];

const CODEX_MARKERS: &[PlanMarker] = &[PlanMarker {
    begin: "--- proposed plan ---",
    end: "--- end plan ---",
}];

const GEMINI_MARKERS: &[PlanMarker] = &[PlanMarker {
    begin: "PLAN:",
    end: "",
}];

const PROFILES: &[AgentProfile] = &[
    AgentProfile {
        kind: AgentKind::Claude,
        binary: "claude",
        plan_args: &["--print", "--permission-mode", "plan"],
        one_shot_args: &["--print", "--dangerously-skip-permissions"],
        approval_record: "y",
        rejection_prefix: "n: ",
        plan_markers: CLAUDE_MARKERS,
        approval_prompt: "Would you like to proceed",
        beta: false,
    },
    AgentProfile {
        kind: AgentKind::Codex,
        binary: "codex",
        plan_args: &["exec", "--plan-only"],
        one_shot_args: &["exec", "--full-auto"],
        approval_record: "approve",
        rejection_prefix: "reject ",
        plan_markers: CODEX_MARKERS,
        approval_prompt: "",
        beta: false,
    },
    AgentProfile {
        kind: AgentKind::Gemini,
        binary: "gemini",
        plan_args: &["--prompt-mode", "plan"],
        one_shot_args: &["--yolo"],
        approval_record: "yes",
        rejection_prefix: "no: ",
        plan_markers: GEMINI_MARKERS,
        approval_prompt: "",
        beta: true,
    },
    AgentProfile {
        kind: AgentKind::Custom,
        binary: "prompt-dock-agent",
        plan_args: &["--plan"],
        one_shot_args: &[],
        approval_record: "approve",
        rejection_prefix: "reject ",
        plan_markers: CLAUDE_MARKERS,
        approval_prompt: "",
        beta: true,
    },
];

/// Look up the static profile for a kind.
#[must_use]
pub fn profile(kind: AgentKind) -> &'static AgentProfile {
    PROFILES
        .iter()
        .find(|p| p.kind == kind)
        .unwrap_or(&PROFILES[0])
}

/// Directories probed after the configured override and before `$PATH`.
fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs_list.push(home.join(".local").join("bin"));
    }
    dirs_list.push(PathBuf::from("/usr/local/bin"));
    dirs_list.push(PathBuf::from("/opt/homebrew/bin"));
    dirs_list
}

/// Resolves agent binaries and reports their versions.
pub struct AgentCatalog {
    config: AgentsConfig,
}

impl AgentCatalog {
    /// Build a catalog from the agents configuration section.
    #[must_use]
    pub fn new(config: AgentsConfig) -> Self {
        Self { config }
    }

    /// The configured default agent kind.
    #[must_use]
    pub fn preferred(&self) -> AgentKind {
        AgentKind::parse(&self.config.preferred).unwrap_or(AgentKind::Claude)
    }

    /// Locate one agent binary and probe its version.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AgentNotAvailable` when no candidate resolves to
    /// an existing file.
    pub async fn locate(&self, kind: AgentKind) -> Result<AgentDescriptor> {
        let prof = profile(kind);
        let path = self
            .resolve_binary(kind, prof.binary)
            .ok_or_else(|| AppError::AgentNotAvailable(format!("{kind} not installed")))?;

        let version = probe_version(&path).await.unwrap_or_else(|| "unknown".into());
        Ok(AgentDescriptor {
            name: kind.as_str().to_owned(),
            version,
            path: path.display().to_string(),
            beta: prof.beta.then_some(true),
        })
    }

    /// Every kind that resolves to an installed binary.
    pub async fn list_installed(&self) -> Vec<AgentDescriptor> {
        let mut agents = Vec::new();
        for prof in PROFILES {
            if let Ok(descriptor) = self.locate(prof.kind).await {
                agents.push(descriptor);
            }
        }
        agents
    }

    fn resolve_binary(&self, kind: AgentKind, binary: &str) -> Option<PathBuf> {
        if let Some(configured) = self.config.paths.get(kind.as_str()) {
            if configured.is_file() {
                return Some(configured.clone());
            }
            debug!(kind = %kind, path = %configured.display(), "configured agent path missing");
        }

        for dir in well_known_dirs() {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        search_path(binary)
    }
}

fn search_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(path).arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().next().map(|line| line.trim().to_owned())
}
