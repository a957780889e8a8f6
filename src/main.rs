#![forbid(unsafe_code)]

//! `prompt-dock` — local bridge daemon for remote-driven coding agents.
//!
//! Subcommands cover the daemon lifecycle (`start`, `stop`, `status`),
//! observability (`logs`, `config`), and agent probing (`test-agent`).

use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use prompt_dock::agent::{AgentCatalog, AgentKind};
use prompt_dock::config::{default_state_dir, ensure_state_dir, BridgeConfig};
use prompt_dock::daemon;
use prompt_dock::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "prompt-dock", about = "Local bridge for remote-driven coding agents", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bridge daemon in the foreground.
    Start {
        /// HTTP port override (message channel binds port + 1 unless configured).
        #[arg(long)]
        port: Option<u16>,
        /// Preferred agent kind override.
        #[arg(long)]
        agent: Option<String>,
        /// Explicit config file path (defaults to `<state-dir>/config.json`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log at debug level.
        #[arg(long)]
        verbose: bool,
        /// Do not announce the pairing URL (reserved for launcher use).
        #[arg(long)]
        no_open: bool,
        /// Hub URL override.
        #[arg(long)]
        hub: Option<String>,
    },

    /// Stop a running daemon.
    Stop,

    /// Report whether the daemon is running.
    Status,

    /// Print the daemon log.
    Logs {
        /// Number of trailing lines to print.
        #[arg(short = 'n', default_value_t = 50)]
        lines: usize,
        /// Keep following the log.
        #[arg(short = 'f')]
        follow: bool,
    },

    /// Print the effective configuration.
    Config,

    /// Probe one agent kind and report its resolution.
    TestAgent {
        /// Agent kind: claude, codex, gemini, or custom.
        kind: String,
    },

    /// Print the version.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Start {
            port,
            agent,
            config,
            verbose,
            no_open,
            hub,
        } => start(port, agent, config, verbose, no_open, hub),
        Command::Stop => stop(),
        Command::Status => status(),
        Command::Logs { lines, follow } => logs(lines, follow),
        Command::Config => print_config(),
        Command::TestAgent { kind } => test_agent(&kind),
        Command::Version => {
            println!("prompt-dock {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(config_path: Option<&PathBuf>, state_dir: &std::path::Path) -> Result<BridgeConfig> {
    match config_path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
            let mut parsed = BridgeConfig::from_json_str(&raw)?;
            // Environment still outranks the file.
            parsed.apply_env();
            parsed.validate()?;
            Ok(parsed)
        }
        None => BridgeConfig::load(state_dir),
    }
}

#[allow(clippy::fn_params_excessive_bools)]
fn start(
    port: Option<u16>,
    agent: Option<String>,
    config_path: Option<PathBuf>,
    verbose: bool,
    no_open: bool,
    hub: Option<String>,
) -> Result<()> {
    let state_dir = default_state_dir()?;
    ensure_state_dir(&state_dir)?;

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(daemon::logfile_path(&state_dir))?;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(Arc::new(log_file)))
        .with_ansi(false)
        .init();

    let mut config = load_config(config_path.as_ref(), &state_dir)?;
    // CLI flags outrank everything.
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(hub) = hub {
        config.hub = Some(hub);
    }
    if let Some(agent) = agent {
        config.agents.preferred = agent;
    }
    config.validate()?;

    if no_open {
        tracing::debug!("pairing URL announcement suppressed");
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| AppError::Internal(format!("failed to build runtime: {err}")))?;
    let result = runtime.block_on(daemon::run(&state_dir, config));
    if let Err(err) = &result {
        error!(%err, "daemon exited with error");
    }
    result
}

fn read_pid(state_dir: &std::path::Path) -> Option<u32> {
    fs::read_to_string(daemon::pidfile_path(state_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: Option<nix::sys::signal::Signal>) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal).is_ok()
}

fn stop() -> Result<()> {
    let state_dir = default_state_dir()?;
    let Some(pid) = read_pid(&state_dir) else {
        return Err(AppError::Config("daemon is not running".into()));
    };

    #[cfg(unix)]
    {
        if !signal_pid(pid, Some(nix::sys::signal::Signal::SIGTERM)) {
            return Err(AppError::Config("daemon is not running".into()));
        }
        println!("sent stop signal to pid {pid}");
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(AppError::Config("stop is only supported on unix".into()))
    }
}

fn status() -> Result<()> {
    let state_dir = default_state_dir()?;
    let config = BridgeConfig::load(&state_dir)?;

    #[cfg(unix)]
    let running = read_pid(&state_dir).is_some_and(|pid| signal_pid(pid, None));
    #[cfg(not(unix))]
    let running = read_pid(&state_dir).is_some();

    if running {
        println!(
            "prompt-dock is running (http {}, channel {})",
            config.port,
            config.ws_port()
        );
    } else {
        println!("prompt-dock is stopped");
    }
    Ok(())
}

fn logs(lines: usize, follow: bool) -> Result<()> {
    let state_dir = default_state_dir()?;
    let path = daemon::logfile_path(&state_dir);
    let file = fs::File::open(&path)
        .map_err(|err| AppError::Config(format!("no log at {}: {err}", path.display())))?;

    let all: Vec<String> = BufReader::new(&file)
        .lines()
        .map_while(std::result::Result::ok)
        .collect();
    for line in all.iter().skip(all.len().saturating_sub(lines)) {
        println!("{line}");
    }

    if follow {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::End(0))?;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                std::thread::sleep(std::time::Duration::from_millis(500));
            } else {
                print!("{line}");
            }
        }
    }
    Ok(())
}

fn print_config() -> Result<()> {
    let state_dir = default_state_dir()?;
    let config = BridgeConfig::load(&state_dir)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn test_agent(kind: &str) -> Result<()> {
    let kind = AgentKind::parse(kind)
        .ok_or_else(|| AppError::Config(format!("unknown agent kind: {kind}")))?;
    let state_dir = default_state_dir()?;
    let config = BridgeConfig::load(&state_dir)?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| AppError::Internal(format!("failed to build runtime: {err}")))?;
    let catalog = AgentCatalog::new(config.agents);
    let descriptor = runtime.block_on(catalog.locate(kind))?;
    println!(
        "{} {} at {}",
        descriptor.name, descriptor.version, descriptor.path
    );
    Ok(())
}
