use serde_json::json;

use foil_policy::ProposalView;

use crate::app_state::AppState;
use crate::engine::action::ActionType;
use crate::engine::coordinator::{self, CaseEvent};
use crate::engine::error::EngineError;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct ExecutionReceipt {
    pub proposal_id: String,
    pub execution_key: String,
    pub job_id: String,
}

/// Fire the side effect for a decided proposal exactly once.
///
/// The execution claim is the idempotency anchor: it is inserted before the
/// delivery job and never rolled back, so a crash or failed submission after
/// the claim can at worst leave a claim whose job must be attached by a
/// retry, never a second delivery.
pub(crate) async fn execute_approved(
    state: &AppState,
    proposal_id: &str,
) -> Result<ExecutionReceipt, EngineError> {
    let kernel = state.kernel();
    let proposal = kernel
        .get_proposal_async(proposal_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;

    if let Some(claim) = kernel.get_claim_async(proposal_id.to_string()).await? {
        return Err(EngineError::AlreadyExecuted {
            executed_at: claim.claimed_at,
            job_id: claim.job_id,
        });
    }
    if proposal.status != "decision_received" {
        return Err(EngineError::StaleState {
            expected: "decision_received".into(),
            current: proposal.status,
        });
    }
    let action = ActionType::parse(&proposal.action_type).ok_or_else(|| {
        EngineError::Invalid(format!("unknown action type {}", proposal.action_type))
    })?;

    let case = kernel
        .get_case_async(proposal.case_id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("case {}", proposal.case_id)))?;

    // Re-validate at the execution boundary: policy may have tightened since
    // the draft was approved.
    let view = ProposalView {
        case_id: proposal.case_id.clone(),
        action_type: proposal.action_type.clone(),
        confidence: proposal.confidence,
        risk_flags: proposal
            .risk_flags
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        fee_amount: proposal.fee_amount,
        autopilot_mode: case.autopilot_mode.clone(),
    };
    let verdict = {
        let policy = state.policy();
        let guard = policy.lock().await;
        guard.validate(&view, &json!({"stage": "execute"}))
    };
    state
        .publish(
            foil_topics::TOPIC_POLICY_DECISION,
            &json!({
                "proposal_id": proposal_id,
                "stage": "execute",
                "blocked": verdict.blocked,
                "violations": verdict.violations,
            }),
        )
        .await;
    if verdict.blocked {
        kernel
            .set_proposal_status_async(proposal_id.to_string(), "blocked".to_string())
            .await?;
        state
            .publish(
                foil_topics::TOPIC_PROPOSALS_BLOCKED,
                &json!({
                    "proposal_id": proposal_id,
                    "case_id": proposal.case_id,
                    "violations": verdict.violations,
                }),
            )
            .await;
        coordinator::transition_or_defer(
            state,
            &proposal.case_id,
            CaseEvent::ReviewRequired {
                reason: "policy_blocked".into(),
            },
        )
        .await;
        return Err(EngineError::PolicyBlocked {
            violations: verdict.violations,
        });
    }

    let execution_key = uuid::Uuid::new_v4().to_string();
    let claimed = kernel
        .insert_claim_async(proposal_id.to_string(), execution_key.clone())
        .await?;
    if !claimed {
        // Another executor claimed between our check and insert.
        let claim = kernel
            .get_claim_async(proposal_id.to_string())
            .await?
            .ok_or_else(|| {
                EngineError::Internal(anyhow::anyhow!(
                    "claim insert rejected without a visible claim"
                ))
            })?;
        return Err(EngineError::AlreadyExecuted {
            executed_at: claim.claimed_at,
            job_id: claim.job_id,
        });
    }

    let behavior = action.behavior();
    let payload = json!({
        "proposal_id": proposal_id,
        "case_id": proposal.case_id,
        "action_type": proposal.action_type,
        "subject": proposal.draft_subject,
        "body": proposal.draft_body,
        "fee_amount": proposal.fee_amount,
        "execution_key": execution_key,
    });
    let handle = match state
        .facility()
        .submit(behavior.delivery_kind, payload, Some(execution_key.clone()))
        .await
    {
        Ok(h) => h,
        Err(e) => {
            // The claim stands. Retrying lands in the AlreadyExecuted path,
            // where the idempotency key makes re-submission safe.
            tracing::error!(
                proposal = %proposal_id,
                error = %e,
                "delivery submission failed after claim; manual or retried submission required"
            );
            return Err(EngineError::Submission(e.to_string()));
        }
    };
    kernel
        .set_claim_job_async(proposal_id.to_string(), handle.job_id.clone())
        .await?;
    kernel
        .mark_proposal_executed_async(proposal_id.to_string(), Some(handle.job_id.clone()))
        .await?;
    state
        .publish(
            foil_topics::TOPIC_PROPOSALS_EXECUTED,
            &json!({
                "proposal_id": proposal_id,
                "case_id": proposal.case_id,
                "job_id": handle.job_id,
                "execution_key": execution_key,
            }),
        )
        .await;
    kernel
        .append_activity_async(
            proposal.case_id.clone(),
            "proposal_executed".to_string(),
            format!("{} delivery queued as job {}", proposal.action_type, handle.job_id),
            None,
        )
        .await?;
    coordinator::transition_or_defer(state, &proposal.case_id, CaseEvent::ReviewCleared).await;

    Ok(ExecutionReceipt {
        proposal_id: proposal_id.to_string(),
        execution_key,
        job_id: handle.job_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{proposals, DecisionAction};
    use crate::test_support::TestHarness;

    async fn seed_decided(h: &TestHarness, case: &str, proposal: &str) {
        h.seed_case(case, "supervised").await;
        h.seed_pending_proposal(proposal, case).await;
        proposals::record_decision(
            &h.state,
            proposal,
            proposals::DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn execution_claims_then_delivers_once() {
        let h = TestHarness::new().await;
        seed_decided(&h, "c1", "p1").await;
        let receipt = execute_approved(&h.state, "p1").await.unwrap();
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "executed");
        assert!(p.executed_at.is_some());
        assert_eq!(p.email_job_id.as_deref(), Some(receipt.job_id.as_str()));

        let err = execute_approved(&h.state, "p1").await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExecuted { .. }));
        assert_eq!(h.facility.submissions("email.send").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_executors_deliver_exactly_once() {
        let h = TestHarness::new().await;
        seed_decided(&h, "c1", "p1").await;
        let mut handles = Vec::new();
        for _ in 0..6 {
            let state = h.state.clone();
            handles.push(tokio::spawn(
                async move { execute_approved(&state, "p1").await },
            ));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(EngineError::AlreadyExecuted { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(h.facility.submissions("email.send").len(), 1);
        assert_eq!(h.state.kernel().count_claims().unwrap(), 1);
    }

    #[tokio::test]
    async fn undecided_proposal_is_stale_for_execution() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_pending_proposal("p1", "c1").await;
        let err = execute_approved(&h.state, "p1").await.unwrap_err();
        assert!(matches!(err, EngineError::StaleState { .. }));
    }

    #[tokio::test]
    async fn failed_delivery_submission_keeps_the_claim() {
        let h = TestHarness::new().await;
        seed_decided(&h, "c1", "p1").await;
        h.facility.fail_next_submit();
        let err = execute_approved(&h.state, "p1").await.unwrap_err();
        assert!(matches!(err, EngineError::Submission(_)));
        // The claim survives so a retry cannot double-deliver.
        let claim = h
            .state
            .kernel()
            .get_claim_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(claim.job_id.is_none());
        let err = execute_approved(&h.state, "p1").await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExecuted { .. }));
    }

    #[tokio::test]
    async fn policy_block_at_execution_marks_the_proposal() {
        let h = TestHarness::with_policy(foil_policy::PolicyConfig {
            allow_all: false,
            rules: vec![foil_policy::PolicyRule::DenyAction {
                action_types: vec!["send_followup".into()],
            }],
        })
        .await;
        seed_decided(&h, "c1", "p1").await;
        let err = execute_approved(&h.state, "p1").await.unwrap_err();
        assert!(matches!(err, EngineError::PolicyBlocked { .. }));
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "blocked");
        assert!(h.facility.submissions("email.send").is_empty());
    }
}
