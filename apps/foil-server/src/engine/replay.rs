use serde_json::{json, Value};

use foil_policy::ProposalView;

use crate::app_state::AppState;
use crate::engine::decide::{self, Disposition, Overrides};
use crate::engine::error::EngineError;

/// Run a dry-run replay to completion. Everything here is read-only against
/// case state: the only rows touched are the replay run's own status and
/// metadata. No claims, no provider calls, no proposals.
pub(crate) async fn execute_dry(state: &AppState, run_id: &str) -> Result<(), EngineError> {
    let kernel = state.kernel();
    let Some(run) = kernel.get_run_async(run_id.to_string()).await? else {
        tracing::warn!(run = %run_id, "dry-run replay job for missing run; skipping");
        return Ok(());
    };
    if !matches!(run.status.as_str(), "queued" | "running") {
        tracing::info!(run = %run_id, status = %run.status, "dry-run replay already settled");
        return Ok(());
    }
    kernel
        .set_run_status_async(run_id.to_string(), "running".to_string(), None)
        .await?;
    state
        .publish(
            foil_topics::TOPIC_RUNS_RUNNING,
            &json!({"run_id": run_id, "case_id": run.case_id, "dry_run": true}),
        )
        .await;

    let source_id = run.replay_of_run_id.clone().ok_or_else(|| {
        EngineError::Invalid(format!("run {run_id} is not a replay"))
    })?;
    let source = kernel
        .get_run_async(source_id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {source_id}")))?;
    let original = match source.proposal_id.clone() {
        Some(pid) => kernel.get_proposal_async(pid.clone()).await?,
        None => None,
    };
    let Some(original) = original else {
        let reason = "source run produced no proposal to simulate";
        kernel
            .set_run_status_async(run_id.to_string(), "failed".to_string(), Some(reason.to_string()))
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_FAILED,
                &json!({"run_id": run_id, "case_id": run.case_id, "error": reason}),
            )
            .await;
        return Ok(());
    };

    let overrides: Overrides = run
        .metadata
        .get("overrides")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| EngineError::Invalid(format!("bad replay overrides: {e}")))?
        .unwrap_or_default();

    let case = kernel
        .get_case_async(run.case_id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("case {}", run.case_id)))?;

    let action_type = overrides
        .action_type
        .clone()
        .unwrap_or_else(|| original.action_type.clone());
    let confidence = overrides.confidence.unwrap_or(original.confidence);
    let risk_flags: Vec<String> = original
        .risk_flags
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let view = ProposalView {
        case_id: run.case_id.clone(),
        action_type: action_type.clone(),
        confidence,
        risk_flags: risk_flags.clone(),
        fee_amount: original.fee_amount,
        autopilot_mode: overrides
            .autopilot_mode
            .clone()
            .unwrap_or_else(|| case.autopilot_mode.clone()),
    };
    let verdict = {
        let policy = state.policy();
        let guard = policy.lock().await;
        guard.validate(&view, &json!({"stage": "replay"}))
    };

    let draft = decide::DraftOutcome {
        action_type: action_type.clone(),
        subject: original.draft_subject.clone(),
        body: original.draft_body.clone(),
        reasoning: vec![],
        confidence,
        risk_flags,
        warnings: vec![],
        fee_amount: original.fee_amount,
    };
    let disposition = decide::disposition(&case.autopilot_mode, &draft, &verdict, &overrides);
    let (sim_auto, sim_requires_human, sim_pause, sim_blocked) = match &disposition {
        Disposition::AutoExecute => (true, false, None, false),
        Disposition::RequireHuman { pause_reason } => {
            (false, true, Some(pause_reason.clone()), false)
        }
        Disposition::Blocked { .. } => (false, true, Some("policy_blocked".to_string()), true),
    };

    let original_view = json!({
        "proposal_id": original.id,
        "action_type": original.action_type,
        "confidence": original.confidence,
        "can_auto_execute": original.can_auto_execute,
        "requires_human": original.requires_human,
        "pause_reason": original.pause_reason,
        "status": original.status,
    });
    let simulated = json!({
        "action_type": action_type,
        "confidence": confidence,
        "can_auto_execute": sim_auto,
        "requires_human": sim_requires_human,
        "pause_reason": sim_pause,
        "blocked": sim_blocked,
    });
    let changes_detected = original.action_type != action_type
        || (original.confidence - confidence).abs() > f64::EPSILON
        || original.can_auto_execute != sim_auto
        || original.requires_human != sim_requires_human
        || sim_blocked != (original.status == "blocked");

    let diff = json!({
        "original_proposal": original_view,
        "simulated_proposal": simulated,
        "validator_result": {"blocked": verdict.blocked, "violations": verdict.violations},
        "state_snapshot": {
            "case_id": case.id,
            "status": case.status,
            "autopilot_mode": case.autopilot_mode,
            "requires_human": case.requires_human,
            "pause_reason": case.pause_reason,
            "next_due": case.next_due,
        },
        "changes_detected": changes_detected,
    });
    let mut metadata = run.metadata.clone();
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("replay".to_string(), diff);
    } else {
        metadata = json!({"replay": diff});
    }
    kernel
        .update_run_metadata_async(run_id.to_string(), metadata)
        .await?;
    kernel
        .set_run_status_async(run_id.to_string(), "completed".to_string(), None)
        .await?;
    state
        .publish(
            foil_topics::TOPIC_RUNS_COMPLETED,
            &json!({
                "run_id": run_id,
                "case_id": run.case_id,
                "dry_run": true,
                "changes_detected": changes_detected,
            }),
        )
        .await;
    Ok(())
}
