//! Integration tests for the agent supervisor, driven with `/bin/sh`
//! standing in for a real agent binary.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use prompt_dock::agent::supervisor::{AgentSupervisor, SpawnedAgent, StreamEvent};
use prompt_dock::agent::{AgentCatalog, AgentKind};
use prompt_dock::config::AgentsConfig;
use prompt_dock::protocol::StreamKind;
use prompt_dock::AppError;

fn sh_supervisor() -> AgentSupervisor {
    let config = AgentsConfig {
        paths: HashMap::from([("custom".to_owned(), PathBuf::from("/bin/sh"))]),
        ..AgentsConfig::default()
    };
    AgentSupervisor::new(Arc::new(AgentCatalog::new(config.clone())), config)
}

/// Drain events until exit, returning (stdout, stderr, exit code).
async fn drain(mut spawned: SpawnedAgent) -> (String, String, Option<i32>) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), spawned.events.recv())
            .await
            .expect("event within deadline");
        match event {
            Some(StreamEvent::Output { stream, data, .. }) => match stream {
                StreamKind::Stdout => stdout.push_str(&data),
                StreamKind::Stderr => stderr.push_str(&data),
            },
            Some(StreamEvent::Exited { code }) => return (stdout, stderr, code),
            Some(_) => {}
            None => return (stdout, stderr, None),
        }
    }
}

#[tokio::test]
async fn one_shot_streams_both_pipes_without_merging() {
    let supervisor = sh_supervisor();
    let workdir = tempfile::tempdir().expect("tempdir");

    let spawned = supervisor
        .start_one_shot(
            AgentKind::Custom,
            "echo to-stdout; echo to-stderr 1>&2",
            workdir.path(),
            &[],
        )
        .await
        .expect("spawn");

    let (stdout, stderr, code) = drain(spawned).await;
    assert_eq!(code, Some(0));
    assert!(stdout.contains("to-stdout"), "stdout was: {stdout:?}");
    assert!(stderr.contains("to-stderr"), "stderr was: {stderr:?}");
    assert!(!stdout.contains("to-stderr"), "streams must not merge");
}

#[tokio::test]
async fn child_runs_in_the_requested_workdir() {
    let supervisor = sh_supervisor();
    let workdir = tempfile::tempdir().expect("tempdir");

    let spawned = supervisor
        .start_one_shot(AgentKind::Custom, "pwd", workdir.path(), &[])
        .await
        .expect("spawn");

    let (stdout, _, code) = drain(spawned).await;
    assert_eq!(code, Some(0));
    let reported = PathBuf::from(stdout.trim());
    assert_eq!(
        reported.canonicalize().expect("canonical reported"),
        workdir.path().canonicalize().expect("canonical expected")
    );
}

#[tokio::test]
async fn cancel_terminates_a_stuck_child() {
    let supervisor = sh_supervisor();
    let workdir = tempfile::tempdir().expect("tempdir");

    let spawned = supervisor
        .start_one_shot(AgentKind::Custom, "sleep 600", workdir.path(), &[])
        .await
        .expect("spawn");

    spawned.handle.cancel();
    let start = tokio::time::Instant::now();
    let (_, _, code) = drain(spawned).await;
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "teardown must finish within signal + grace"
    );
    // SIGTERM exits without a code on most shells.
    assert_ne!(code, Some(0));
}

#[tokio::test]
async fn missing_binary_reports_agent_not_available() {
    let config = AgentsConfig {
        paths: HashMap::from([(
            "custom".to_owned(),
            PathBuf::from("/nonexistent/agent-binary"),
        )]),
        ..AgentsConfig::default()
    };
    let supervisor = AgentSupervisor::new(Arc::new(AgentCatalog::new(config.clone())), config);
    let workdir = tempfile::tempdir().expect("tempdir");

    let result = supervisor
        .start_one_shot(AgentKind::Custom, "echo hi", workdir.path(), &[])
        .await;
    assert!(matches!(result, Err(AppError::AgentNotAvailable(_))));
}
