//! Unit tests for the plan registry and its approval state machine.

use std::path::PathBuf;

use prompt_dock::agent::AgentKind;
use prompt_dock::plans::{PlanRegistry, PlanState};
use prompt_dock::AppError;

fn proposed(registry: &PlanRegistry, session: &str) -> String {
    registry
        .create(
            session,
            "add tests",
            PathBuf::from("/tmp/repo"),
            AgentKind::Claude,
            "1. write tests\n2. run them".into(),
            vec![],
            false,
        )
        .id
}

#[test]
fn approve_moves_proposed_to_approved() {
    let registry = PlanRegistry::new();
    let id = proposed(&registry, "sess-1");

    let plan = registry.approve(&id, "sess-1").expect("approve");
    assert_eq!(plan.state, PlanState::Approved);
    assert!(plan.approved_at.is_some());

    // Approving again is a harmless no-op.
    assert_eq!(
        registry.approve(&id, "sess-1").expect("idempotent").state,
        PlanState::Approved
    );
}

#[test]
fn only_the_owner_may_transition() {
    let registry = PlanRegistry::new();
    let id = proposed(&registry, "sess-1");

    assert!(matches!(
        registry.approve(&id, "sess-2"),
        Err(AppError::PlanOwnershipViolation(_))
    ));
    assert!(matches!(
        registry.reject(&id, "sess-2", None),
        Err(AppError::PlanOwnershipViolation(_))
    ));
    // The plan is untouched by the foreign attempts.
    assert_eq!(registry.get(&id).expect("still there").state, PlanState::Proposed);
}

#[test]
fn reject_is_terminal_and_removes_the_plan() {
    let registry = PlanRegistry::new();
    let id = proposed(&registry, "sess-1");

    let plan = registry
        .reject(&id, "sess-1", Some("too risky"))
        .expect("reject");
    assert_eq!(plan.state, PlanState::Rejected);
    assert_eq!(plan.rejection_reason.as_deref(), Some("too risky"));
    assert!(registry.get(&id).is_none());
    assert!(matches!(
        registry.approve(&id, "sess-1"),
        Err(AppError::PlanNotFound(_))
    ));
}

#[test]
fn execution_requires_an_approved_plan() {
    let registry = PlanRegistry::new();
    let id = proposed(&registry, "sess-1");

    assert!(matches!(
        registry.require_approved(&id, "sess-1"),
        Err(AppError::PlanNotApproved(_))
    ));
    assert!(matches!(
        registry.require_approved("pl-NONE", "sess-1"),
        Err(AppError::PlanNotFound(_))
    ));

    registry.approve(&id, "sess-1").expect("approve");
    registry.require_approved(&id, "sess-1").expect("approved");

    registry.mark_executed(&id);
    assert!(matches!(
        registry.require_approved(&id, "sess-1"),
        Err(AppError::PlanAlreadyExecuted(_))
    ));
}

#[test]
fn sweep_leaves_fresh_plans_alone() {
    let registry = PlanRegistry::new();
    let id = proposed(&registry, "sess-1");
    assert!(registry.sweep().is_empty());
    assert!(registry.get(&id).is_some());
}

#[test]
fn drop_session_removes_only_that_sessions_plans() {
    let registry = PlanRegistry::new();
    let mine = proposed(&registry, "sess-1");
    let theirs = proposed(&registry, "sess-2");

    registry.drop_session("sess-1");
    assert!(registry.get(&mine).is_none());
    assert!(registry.get(&theirs).is_some());
}
