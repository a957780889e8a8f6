//! Bridge configuration parsing, validation, and environment overrides.
//!
//! Configuration lives at `<state-dir>/config.json`. Precedence, lowest to
//! highest: built-in defaults, config file, environment variables
//! (`PROMPT_DOCK_PORT`, `PROMPT_DOCK_WS_PORT`, `PROMPT_DOCK_HUB`,
//! `LOG_LEVEL`), CLI flags.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, Result};

/// Default HTTP listener port.
pub const DEFAULT_PORT: u16 = 51720;

/// Browser origins accepted out of the box.
const BUILTIN_ORIGINS: &[&str] = &["http://localhost:5173", "https://app.promptdock.dev"];

/// Security-related tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Session sliding-window lifetime in milliseconds. Minimum 60 000.
    pub session_timeout: u64,
    /// Maximum admissible command age in milliseconds.
    pub command_timeout: u64,
    /// Maximum admissible future timestamp in milliseconds.
    pub clock_skew_tolerance: u64,
    /// Rate limiter ceiling per 60-second window.
    pub max_commands_per_minute: u32,
    /// Gate for honouring `customOrigins`.
    pub allow_custom_origins: bool,
    /// Operator acknowledgement that custom origins widen the attack surface.
    pub custom_origin_acknowledged: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout: 30 * 60 * 1000,
            command_timeout: 30_000,
            clock_skew_tolerance: 5_000,
            max_commands_per_minute: 100,
            allow_custom_origins: false,
            custom_origin_acknowledged: false,
        }
    }
}

/// Agent supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    /// Agent kind used when a client does not name one.
    pub preferred: String,
    /// Per-kind binary path overrides, tried before well-known locations.
    pub paths: HashMap<String, PathBuf>,
    /// Maximum wall-clock time for one agent run, in milliseconds. Minimum 30 000.
    pub timeout: u64,
    /// Spawn retry attempts before reporting the agent unavailable.
    pub retry_attempts: u32,
    /// Output ring-buffer capacity per stream, in bytes.
    pub max_buffer_bytes: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            preferred: "claude".into(),
            paths: HashMap::new(),
            timeout: 10 * 60 * 1000,
            retry_attempts: 1,
            max_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Flags forwarded verbatim to the workspace adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GitConfig {
    /// Create a backup stash before every execution.
    pub auto_snapshot: bool,
    /// Commit modified files automatically after a successful execution.
    pub auto_commit: bool,
    /// Branch used as the base for worktrees and pull requests.
    pub default_base_branch: Option<String>,
}

/// Top-level bridge configuration, persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// HTTP listener port.
    pub port: u16,
    /// Message-channel listener port. Defaults to `port + 1`; must differ.
    pub ws_port: Option<u16>,
    /// Exhaustive set of accepted origin values.
    pub allowed_origins: Vec<String>,
    /// Extra origins honoured only when both security gates are set.
    pub custom_origins: Vec<String>,
    /// Optional hub URL the daemon announces itself to.
    pub hub: Option<String>,
    /// Security tuning.
    pub security: SecurityConfig,
    /// Agent supervisor tuning.
    pub agents: AgentsConfig,
    /// Workspace adapter flags.
    pub git: GitConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ws_port: None,
            allowed_origins: BUILTIN_ORIGINS.iter().map(ToString::to_string).collect(),
            custom_origins: Vec::new(),
            hub: None,
            security: SecurityConfig::default(),
            agents: AgentsConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `<state_dir>/config.json`, falling back to
    /// defaults when the file does not exist, then apply environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be read or
    /// parsed, or if validation fails.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("config.json");
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
            Self::from_json_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string. Does not apply environment
    /// overrides; the caller decides whether those are in play.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective message-channel port.
    #[must_use]
    pub fn ws_port(&self) -> u16 {
        self.ws_port.unwrap_or(self.port + 1)
    }

    /// The full set of origins a connection may declare.
    ///
    /// `custom_origins` extends the allow-list only when both security gates
    /// are set; otherwise it is ignored with a warning.
    #[must_use]
    pub fn effective_origins(&self) -> Vec<String> {
        let mut origins = self.allowed_origins.clone();
        if self.custom_origins.is_empty() {
            return origins;
        }
        if self.security.allow_custom_origins && self.security.custom_origin_acknowledged {
            origins.extend(self.custom_origins.iter().cloned());
        } else {
            warn!(
                count = self.custom_origins.len(),
                "customOrigins present but not acknowledged; ignoring"
            );
        }
        origins
    }

    /// Overlay environment variables onto the file-derived values.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_parse::<u16>("PROMPT_DOCK_PORT") {
            self.port = port;
        }
        if let Some(ws_port) = env_parse::<u16>("PROMPT_DOCK_WS_PORT") {
            self.ws_port = Some(ws_port);
        }
        if let Ok(hub) = env::var("PROMPT_DOCK_HUB") {
            if !hub.is_empty() {
                self.hub = Some(hub);
            }
        }
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.ws_port() == self.port {
            return Err(AppError::Config(
                "wsPort must differ from port".into(),
            ));
        }
        if self.security.session_timeout < 60_000 {
            return Err(AppError::Config(
                "security.sessionTimeout must be at least 60000 ms".into(),
            ));
        }
        if self.security.max_commands_per_minute == 0 {
            return Err(AppError::Config(
                "security.maxCommandsPerMinute must be at least 1".into(),
            ));
        }
        if self.agents.timeout < 30_000 {
            return Err(AppError::Config(
                "agents.timeout must be at least 30000 ms".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Resolve the bridge state directory.
///
/// Priority: `$PROMPT_DOCK_HOME`, then `~/.prompt-dock`.
///
/// # Errors
///
/// Returns `AppError::Config` when no home directory can be determined.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("PROMPT_DOCK_HOME") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".prompt-dock"))
        .ok_or_else(|| AppError::Config("cannot determine home directory".into()))
}

/// Ensure the state directory and its `keys/` subdirectory exist with
/// owner-only permissions.
///
/// # Errors
///
/// Returns `AppError::Io` if creation or permission tightening fails.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path.join("keys"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
        fs::set_permissions(path.join("keys"), fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
