//! Agent subprocess orchestration: locating binaries, supervising
//! processes, and extracting plan artifacts from transcripts.

pub mod catalog;
pub mod output;
pub mod plan_extract;
pub mod supervisor;

use serde::{Deserialize, Serialize};

/// Supported agent integrations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Anthropic Claude Code CLI.
    Claude,
    /// OpenAI Codex CLI.
    Codex,
    /// Google Gemini CLI.
    Gemini,
    /// User-supplied binary configured via `agents.paths.custom`.
    Custom,
}

impl AgentKind {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Custom => "custom",
        }
    }

    /// Parse a client-supplied kind string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one supervised subprocess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Spawned but not yet producing output.
    Idle,
    /// Producing a plan.
    Planning,
    /// Plan produced; child is alive waiting for an approval record on stdin.
    AwaitingApproval,
    /// Applying an approved plan.
    Executing,
    /// Child has exited.
    Exited,
}

impl AgentState {
    /// Wire form used in `agent-state-change` events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Exited => "exited",
        }
    }
}

pub use catalog::AgentCatalog;
pub use supervisor::AgentSupervisor;
