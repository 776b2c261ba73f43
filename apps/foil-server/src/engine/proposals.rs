use serde_json::json;

use foil_kernel::{NewProposal, ProposalRow};

use crate::app_state::AppState;
use crate::engine::action::ActionType;
use crate::engine::coordinator::{self, CaseEvent};
use crate::engine::error::EngineError;
use crate::engine::{DecisionAction, TriggerType};

pub(crate) struct DecisionRequest {
    pub action: DecisionAction,
    pub instruction: Option<String>,
    pub reason: Option<String>,
    pub decided_by: Option<String>,
}

#[derive(Debug)]
pub(crate) struct DecisionOutcome {
    pub proposal: ProposalRow,
    /// Set when the decision spawned a resume run (approve / adjust).
    pub resume_run_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum ProposalOutcome {
    Created(ProposalRow),
    /// An open proposal already existed for the case; no new row was written.
    Existing(ProposalRow),
}

impl ProposalOutcome {
    pub fn row(&self) -> &ProposalRow {
        match self {
            ProposalOutcome::Created(p) | ProposalOutcome::Existing(p) => p,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, ProposalOutcome::Created(_))
    }
}

/// Open a proposal for a case. At most one proposal per case may be open: a
/// loop-guarded action colliding with an open proposal of the same type gets
/// the existing row back (a followup trigger that fires twice must not
/// propose the same email twice), any other collision is surfaced instead of
/// silently replacing the one in flight.
pub(crate) async fn create_proposal(
    state: &AppState,
    new: NewProposal,
) -> Result<ProposalOutcome, EngineError> {
    let kernel = state.kernel();
    let action = ActionType::parse(&new.action_type)
        .ok_or_else(|| EngineError::Invalid(format!("unknown action type {}", new.action_type)))?;
    if let Some(open) = kernel.find_open_proposal_async(new.case_id.clone()).await? {
        return reuse_or_reject(&new, action, open);
    }
    let inserted = kernel.insert_proposal_async(new.clone()).await?;
    if !inserted {
        let open = kernel
            .find_open_proposal_async(new.case_id.clone())
            .await?
            .ok_or_else(|| {
                EngineError::Internal(anyhow::anyhow!(
                    "proposal insert rejected without a visible open proposal"
                ))
            })?;
        return reuse_or_reject(&new, action, open);
    }
    state
        .publish(
            foil_topics::TOPIC_PROPOSALS_CREATED,
            &json!({
                "proposal_id": new.id,
                "case_id": new.case_id,
                "action_type": new.action_type,
                "status": new.status,
            }),
        )
        .await;
    let row = kernel
        .get_proposal_async(new.id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proposal {}", new.id)))?;
    Ok(ProposalOutcome::Created(row))
}

fn reuse_or_reject(
    new: &NewProposal,
    action: ActionType,
    open: ProposalRow,
) -> Result<ProposalOutcome, EngineError> {
    if action.behavior().loop_guarded && open.action_type == new.action_type {
        tracing::info!(
            case = %new.case_id,
            proposal = %open.id,
            action = %new.action_type,
            "open proposal exists; reusing it"
        );
        return Ok(ProposalOutcome::Existing(open));
    }
    tracing::warn!(
        case = %new.case_id,
        proposal = %open.id,
        attempted = %new.action_type,
        "open proposal blocks a new one"
    );
    Err(EngineError::Invalid(format!(
        "case {} already has open proposal {} ({}); resolve it before proposing {}",
        new.case_id, open.id, open.action_type, new.action_type
    )))
}

/// Record a human decision on an open proposal.
///
/// For approve/adjust the resume work is submitted while the proposal is
/// still `pending_approval` and the status is only flipped afterwards. If
/// submission fails, the proposal therefore stays decidable and the operator
/// can simply retry; the alternative order would leave a decided proposal
/// with no run to act on it.
pub(crate) async fn record_decision(
    state: &AppState,
    proposal_id: &str,
    req: DecisionRequest,
) -> Result<DecisionOutcome, EngineError> {
    let kernel = state.kernel();
    let proposal = kernel
        .get_proposal_async(proposal_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;

    match req.action {
        DecisionAction::Approve | DecisionAction::Adjust => {
            if proposal.status != "pending_approval" {
                return Err(EngineError::StaleState {
                    expected: "pending_approval".into(),
                    current: proposal.status,
                });
            }
            decide_with_resume(state, &proposal, req).await
        }
        DecisionAction::Dismiss => {
            // A blocked proposal's only exit is dismissal.
            if !matches!(proposal.status.as_str(), "pending_approval" | "blocked") {
                return Err(EngineError::StaleState {
                    expected: "pending_approval|blocked".into(),
                    current: proposal.status,
                });
            }
            resolve_without_run(state, &proposal, req, "dismissed").await
        }
        DecisionAction::Withdraw => {
            if !matches!(proposal.status.as_str(), "pending_approval" | "blocked") {
                return Err(EngineError::StaleState {
                    expected: "pending_approval|blocked".into(),
                    current: proposal.status,
                });
            }
            resolve_without_run(state, &proposal, req, "withdrawn").await
        }
    }
}

async fn decide_with_resume(
    state: &AppState,
    proposal: &ProposalRow,
    req: DecisionRequest,
) -> Result<DecisionOutcome, EngineError> {
    let kernel = state.kernel();
    let case_id = proposal.case_id.clone();

    // A run paused on this decision is superseded by the resume run; anything
    // else actively holding the slot is a real conflict.
    if let Some(active) = kernel.find_active_run_async(case_id.clone()).await? {
        if active.status == "paused" {
            kernel
                .set_run_status_async(active.id.clone(), "completed".to_string(), None)
                .await?;
            state
                .publish(
                    foil_topics::TOPIC_RUNS_COMPLETED,
                    &json!({"run_id": active.id, "case_id": case_id, "superseded_by_decision": true}),
                )
                .await;
        } else {
            return Err(EngineError::Conflict {
                case_id,
                active_run_id: active.id,
                status: active.status,
            });
        }
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let inserted = kernel
        .insert_run_async(
            run_id.clone(),
            case_id.clone(),
            TriggerType::Resume.as_str().to_string(),
            false,
            None,
            false,
            proposal.trigger_message_id.clone(),
            json!({"proposal_id": proposal.id, "decision": req.action.as_str()}),
        )
        .await?;
    if !inserted {
        let active = kernel.find_active_run_async(case_id.clone()).await?;
        return Err(match active {
            Some(a) => EngineError::Conflict {
                case_id,
                active_run_id: a.id,
                status: a.status,
            },
            None => EngineError::Internal(anyhow::anyhow!(
                "resume run insert rejected without a visible active run"
            )),
        });
    }

    let payload = json!({
        "case_id": case_id,
        "run_id": run_id,
        "proposal_id": proposal.id,
        "decision": req.action.as_str(),
        "instruction": req.instruction,
    });
    if let Err(e) = state.facility().submit("case.resume", payload, None).await {
        let detail = e.to_string();
        kernel
            .set_run_status_async(
                run_id.clone(),
                "failed".to_string(),
                Some(format!("submission failed: {detail}")),
            )
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_FAILED,
                &json!({"run_id": run_id, "case_id": case_id, "error": detail}),
            )
            .await;
        // The proposal is untouched: still pending, still decidable.
        return Err(EngineError::Submission(detail));
    }

    let new_status = match req.action {
        DecisionAction::Approve => "decision_received",
        _ => "adjustment_requested",
    };
    let flipped = kernel
        .record_decision_async(
            proposal.id.clone(),
            "pending_approval".to_string(),
            new_status.to_string(),
            req.action.as_str().to_string(),
            req.instruction.clone(),
            req.reason.clone(),
            req.decided_by.clone(),
        )
        .await?;
    if !flipped {
        // A concurrent decision won between our read and this update. The
        // resume run we queued must not act on the other decision.
        kernel
            .set_run_status_async(
                run_id.clone(),
                "failed".to_string(),
                Some("decision raced and lost".to_string()),
            )
            .await?;
        let current = kernel
            .get_proposal_async(proposal.id.clone())
            .await?
            .map(|p| p.status)
            .unwrap_or_else(|| "unknown".into());
        return Err(EngineError::StaleState {
            expected: "pending_approval".into(),
            current,
        });
    }

    complete_waitpoint_best_effort(state, proposal, req.action).await;
    state
        .publish(
            foil_topics::TOPIC_PROPOSALS_DECIDED,
            &json!({
                "proposal_id": proposal.id,
                "case_id": case_id,
                "action": req.action.as_str(),
                "resume_run_id": run_id,
            }),
        )
        .await;
    kernel
        .append_activity_async(
            case_id.clone(),
            "decision_recorded".to_string(),
            format!("{} on proposal {}", req.action.as_str(), proposal.id),
            None,
        )
        .await?;
    coordinator::transition_or_defer(state, &case_id, CaseEvent::ReviewCleared).await;

    let updated = kernel
        .get_proposal_async(proposal.id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proposal {}", proposal.id)))?;
    Ok(DecisionOutcome {
        proposal: updated,
        resume_run_id: Some(run_id),
    })
}

async fn resolve_without_run(
    state: &AppState,
    proposal: &ProposalRow,
    req: DecisionRequest,
    new_status: &str,
) -> Result<DecisionOutcome, EngineError> {
    let kernel = state.kernel();
    let case_id = proposal.case_id.clone();
    let flipped = kernel
        .record_decision_async(
            proposal.id.clone(),
            proposal.status.clone(),
            new_status.to_string(),
            req.action.as_str().to_string(),
            req.instruction.clone(),
            req.reason.clone(),
            req.decided_by.clone(),
        )
        .await?;
    if !flipped {
        let current = kernel
            .get_proposal_async(proposal.id.clone())
            .await?
            .map(|p| p.status)
            .unwrap_or_else(|| "unknown".into());
        return Err(EngineError::StaleState {
            expected: proposal.status.clone(),
            current,
        });
    }

    // A run paused on this decision has nothing left to wait for.
    if let Some(active) = kernel.find_active_run_async(case_id.clone()).await? {
        if active.status == "paused" {
            kernel
                .set_run_status_async(active.id.clone(), "completed".to_string(), None)
                .await?;
            state
                .publish(
                    foil_topics::TOPIC_RUNS_COMPLETED,
                    &json!({"run_id": active.id, "case_id": case_id, "resolved_by": new_status}),
                )
                .await;
        }
    }

    complete_waitpoint_best_effort(state, proposal, req.action).await;
    state
        .publish(
            foil_topics::TOPIC_PROPOSALS_DECIDED,
            &json!({
                "proposal_id": proposal.id,
                "case_id": case_id,
                "action": req.action.as_str(),
            }),
        )
        .await;
    kernel
        .append_activity_async(
            case_id.clone(),
            "decision_recorded".to_string(),
            format!("{} on proposal {}", req.action.as_str(), proposal.id),
            None,
        )
        .await?;

    let event = match req.action {
        DecisionAction::Withdraw => CaseEvent::Withdrawn {
            reason: req.reason.clone(),
        },
        _ => CaseEvent::ReviewCleared,
    };
    coordinator::transition_or_defer(state, &case_id, event).await;

    let updated = kernel
        .get_proposal_async(proposal.id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proposal {}", proposal.id)))?;
    Ok(DecisionOutcome {
        proposal: updated,
        resume_run_id: None,
    })
}

/// The workflow handle behind a pending proposal, if any, gets poked so a
/// suspended execution can observe the decision. Failures are logged, never
/// surfaced: the decision is already durable.
async fn complete_waitpoint_best_effort(
    state: &AppState,
    proposal: &ProposalRow,
    action: DecisionAction,
) {
    let Some(token) = proposal.waitpoint_token.as_deref() else {
        return;
    };
    let signal = json!({"decision": action.as_str(), "proposal_id": proposal.id});
    match state.facility().complete_waitpoint(token, signal).await {
        Ok(()) => {
            state
                .publish(
                    foil_topics::TOPIC_WAITPOINT_COMPLETED,
                    &json!({"proposal_id": proposal.id, "decision": action.as_str()}),
                )
                .await;
        }
        Err(e) => {
            tracing::warn!(
                proposal = %proposal.id,
                error = %e,
                "waitpoint completion failed; decision stands"
            );
        }
    }
}

/// Build the insert payload for a drafted action.
#[allow(clippy::too_many_arguments)]
pub(crate) fn draft_to_proposal(
    case_id: &str,
    trigger_message_id: Option<String>,
    action: ActionType,
    draft: &crate::engine::decide::DraftOutcome,
    status: &str,
    can_auto_execute: bool,
    pause_reason: Option<String>,
    adjustment_count: i64,
) -> NewProposal {
    NewProposal {
        id: uuid::Uuid::new_v4().to_string(),
        case_id: case_id.to_string(),
        trigger_message_id,
        action_type: action.as_str().to_string(),
        draft_subject: draft.subject.clone(),
        draft_body: draft.body.clone(),
        fee_amount: draft.fee_amount,
        reasoning: json!(draft.reasoning),
        confidence: draft.confidence,
        risk_flags: json!(draft.risk_flags),
        warnings: json!(draft.warnings),
        can_auto_execute,
        requires_human: !can_auto_execute,
        pause_reason: pause_reason.clone(),
        waitpoint_token: Some(uuid::Uuid::new_v4().to_string()),
        status: status.to_string(),
        adjustment_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn approve_queues_resume_work_then_flips_status() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_paused_run("r1", "c1", "p1").await;
        h.seed_pending_proposal("p1", "c1").await;
        let out = record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: Some("analyst".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(out.proposal.status, "decision_received");
        let resume_id = out.resume_run_id.unwrap();
        let resume = h
            .state
            .kernel()
            .get_run_async(resume_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resume.trigger_type, "resume");
        assert_eq!(resume.status, "queued");
        // The paused run was superseded.
        let paused = h
            .state
            .kernel()
            .get_run_async("r1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paused.status, "completed");
        assert_eq!(h.facility.submissions("case.resume").len(), 1);
    }

    #[tokio::test]
    async fn failed_resume_submission_leaves_the_proposal_decidable() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_pending_proposal("p1", "c1").await;
        h.facility.fail_next_submit();
        let err = record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Submission(_)));
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        // No split brain: status never advanced.
        assert_eq!(p.status, "pending_approval");
        // And the retry path works once the facility recovers.
        let out = record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.proposal.status, "decision_received");
    }

    #[tokio::test]
    async fn second_decision_is_stale() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_pending_proposal("p1", "c1").await;
        record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Dismiss,
                instruction: None,
                reason: Some("no longer needed".into()),
                decided_by: None,
            },
        )
        .await
        .unwrap();
        let err = record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::StaleState { .. }));
    }

    #[tokio::test]
    async fn dismissal_completes_a_paused_run() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_paused_run("r1", "c1", "p1").await;
        h.seed_pending_proposal("p1", "c1").await;
        let out = record_decision(
            &h.state,
            "p1",
            DecisionRequest {
                action: DecisionAction::Dismiss,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(out.proposal.status, "dismissed");
        assert!(out.resume_run_id.is_none());
        let run = h
            .state
            .kernel()
            .get_run_async("r1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, "completed");
        assert!(h.facility.submissions("case.resume").is_empty());
    }

    #[tokio::test]
    async fn duplicate_trigger_reuses_the_open_proposal() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        let draft = crate::engine::decide::DraftOutcome {
            action_type: "send_followup".into(),
            subject: Some("Re: request".into()),
            body: Some("checking in".into()),
            reasoning: vec![],
            confidence: 0.8,
            risk_flags: vec![],
            warnings: vec![],
            fee_amount: None,
        };
        let first = create_proposal(
            &h.state,
            draft_to_proposal(
                "c1",
                None,
                ActionType::SendFollowup,
                &draft,
                "pending_approval",
                false,
                Some("awaiting_approval".into()),
                0,
            ),
        )
        .await
        .unwrap();
        assert!(first.created());
        let second = create_proposal(
            &h.state,
            draft_to_proposal(
                "c1",
                None,
                ActionType::SendFollowup,
                &draft,
                "pending_approval",
                false,
                Some("awaiting_approval".into()),
                0,
            ),
        )
        .await
        .unwrap();
        assert!(!second.created());
        assert_eq!(second.row().id, first.row().id);
    }

    #[tokio::test]
    async fn unguarded_collision_is_surfaced_not_reused() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        // A followup proposal is already in flight for the case.
        h.seed_pending_proposal("p1", "c1").await;
        let draft = crate::engine::decide::DraftOutcome {
            action_type: "send_appeal".into(),
            subject: Some("Appeal".into()),
            body: Some("appealing the denial".into()),
            reasoning: vec![],
            confidence: 0.9,
            risk_flags: vec![],
            warnings: vec![],
            fee_amount: None,
        };
        let err = create_proposal(
            &h.state,
            draft_to_proposal(
                "c1",
                None,
                ActionType::SendAppeal,
                &draft,
                "pending_approval",
                false,
                None,
                0,
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
        let open = h
            .state
            .kernel()
            .find_open_proposal_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.id, "p1");
        assert_eq!(open.status, "pending_approval");
    }
}
