//! Plan artifacts and the approval state machine.
//!
//! Plans are owned by the session that created them; only the owner may
//! transition a plan. Rejected plans are removed immediately; proposed
//! plans that collect no approval for thirty minutes are garbage-collected
//! by the sweeper.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::agent::AgentKind;
use crate::{AppError, Result};

/// Unapproved plans live this long.
const PROPOSED_TTL_MINS: i64 = 30;

/// Lifecycle state of a plan.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    /// Produced by plan mode, awaiting an owner decision.
    Proposed,
    /// Approved; may be executed exactly once.
    Approved,
    /// Rejected by the owner; terminal, removed from the registry.
    Rejected,
    /// An execution of this plan completed.
    Executed,
    /// Garbage-collected without a decision.
    Expired,
}

/// One plan artifact.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Registry identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// The prompt that produced the plan.
    pub prompt: String,
    /// Working directory the plan applies to.
    pub workdir: PathBuf,
    /// Agent that produced the plan and will execute it.
    pub agent_kind: AgentKind,
    /// The recovered plan text.
    pub plan_text: String,
    /// Files the planner expects to touch (best-effort hint).
    pub modified_files_hint: Vec<String>,
    /// Current lifecycle state.
    pub state: PlanState,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Approval instant, when approved.
    pub approved_at: Option<DateTime<Utc>>,
    /// Rejection instant, when rejected.
    pub rejected_at: Option<DateTime<Utc>>,
    /// Execution-complete instant, when executed.
    pub executed_at: Option<DateTime<Utc>>,
    /// Why the owner rejected the plan.
    pub rejection_reason: Option<String>,
    /// Whether the planning child is alive awaiting interactive approval.
    pub awaits_interactive_approval: bool,
}

/// In-memory registry of plans keyed by id.
#[derive(Default)]
pub struct PlanRegistry {
    plans: Mutex<HashMap<String, Plan>>,
}

impl PlanRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh plan in the PROPOSED state.
    pub fn create(
        &self,
        session_id: &str,
        prompt: &str,
        workdir: PathBuf,
        agent_kind: AgentKind,
        plan_text: String,
        modified_files_hint: Vec<String>,
        awaits_interactive_approval: bool,
    ) -> Plan {
        let plan = Plan {
            id: format!("pl-{}", Uuid::new_v4()),
            session_id: session_id.to_owned(),
            prompt: prompt.to_owned(),
            workdir,
            agent_kind,
            plan_text,
            modified_files_hint,
            state: PlanState::Proposed,
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            executed_at: None,
            rejection_reason: None,
            awaits_interactive_approval,
        };
        self.plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(plan.id.clone(), plan.clone());
        plan
    }

    /// Look up a plan by id.
    pub fn get(&self, plan_id: &str) -> Option<Plan> {
        self.plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(plan_id)
            .cloned()
    }

    /// Transition PROPOSED → APPROVED.
    ///
    /// Approving an already-approved plan is a no-op; every other state is
    /// refused.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `PlanOwnershipViolation`, `PlanAlreadyExecuted`, or
    /// `PlanNotApproved` (for states that cannot be approved).
    pub fn approve(&self, plan_id: &str, session_id: &str) -> Result<Plan> {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let plan = plans
            .get_mut(plan_id)
            .ok_or_else(|| AppError::PlanNotFound(plan_id.to_owned()))?;
        check_owner(plan, session_id)?;
        match plan.state {
            PlanState::Proposed => {
                plan.state = PlanState::Approved;
                plan.approved_at = Some(Utc::now());
                Ok(plan.clone())
            }
            PlanState::Approved => Ok(plan.clone()),
            PlanState::Executed => Err(AppError::PlanAlreadyExecuted(plan_id.to_owned())),
            PlanState::Rejected | PlanState::Expired => {
                Err(AppError::PlanNotFound(plan_id.to_owned()))
            }
        }
    }

    /// Transition PROPOSED → REJECTED and remove the plan.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `PlanOwnershipViolation`, or `PlanAlreadyExecuted`.
    pub fn reject(&self, plan_id: &str, session_id: &str, reason: Option<&str>) -> Result<Plan> {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let plan = plans
            .get(plan_id)
            .ok_or_else(|| AppError::PlanNotFound(plan_id.to_owned()))?;
        check_owner(plan, session_id)?;
        if plan.state == PlanState::Executed {
            return Err(AppError::PlanAlreadyExecuted(plan_id.to_owned()));
        }
        let mut plan = plans
            .remove(plan_id)
            .unwrap_or_else(|| unreachable!("plan present under lock"));
        plan.state = PlanState::Rejected;
        plan.rejected_at = Some(Utc::now());
        plan.rejection_reason = reason.map(ToOwned::to_owned);
        Ok(plan)
    }

    /// Require that a plan is APPROVED and owned by `session_id`.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `PlanOwnershipViolation`, `PlanAlreadyExecuted`, or
    /// `PlanNotApproved`.
    pub fn require_approved(&self, plan_id: &str, session_id: &str) -> Result<Plan> {
        let plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let plan = plans
            .get(plan_id)
            .ok_or_else(|| AppError::PlanNotFound(plan_id.to_owned()))?;
        check_owner(plan, session_id)?;
        match plan.state {
            PlanState::Approved => Ok(plan.clone()),
            PlanState::Executed => Err(AppError::PlanAlreadyExecuted(plan_id.to_owned())),
            _ => Err(AppError::PlanNotApproved(plan_id.to_owned())),
        }
    }

    /// Transition APPROVED → EXECUTED after a completed execution.
    pub fn mark_executed(&self, plan_id: &str) {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(plan) = plans.get_mut(plan_id) {
            plan.state = PlanState::Executed;
            plan.executed_at = Some(Utc::now());
        }
    }

    /// Remove PROPOSED plans older than thirty minutes.
    ///
    /// Returns the ids of the expired plans.
    pub fn sweep(&self) -> Vec<String> {
        let cutoff = Utc::now() - Duration::minutes(PROPOSED_TTL_MINS);
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired: Vec<String> = plans
            .iter()
            .filter(|(_, p)| p.state == PlanState::Proposed && p.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            plans.remove(id);
        }
        expired
    }

    /// Remove every plan owned by a session (used on revocation).
    pub fn drop_session(&self, session_id: &str) {
        self.plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|_, p| p.session_id != session_id);
    }
}

fn check_owner(plan: &Plan, session_id: &str) -> Result<()> {
    if plan.session_id == session_id {
        Ok(())
    } else {
        Err(AppError::PlanOwnershipViolation(plan.id.clone()))
    }
}
