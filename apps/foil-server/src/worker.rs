use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use foil_kernel::JobRow;

use crate::app_state::AppState;
use crate::engine::coordinator::{self, CaseEvent};
use crate::engine::decide::{self, Disposition, DraftOutcome, Overrides};
use crate::engine::error::EngineError;
use crate::engine::proposals::{self, ProposalOutcome};
use crate::engine::{execution, replay};
use crate::engine::action::ActionType;
use crate::tasks::TaskHandle;
use crate::util::{env_u64, now_iso};

const IDLE_WAIT: Duration = Duration::from_millis(500);

pub(crate) fn max_attempts() -> i64 {
    env_u64("FOIL_JOB_MAX_ATTEMPTS", 3).max(1) as i64
}

/// In-process worker: drains the job table, parking on the queue signal when
/// idle. One claim statement per job keeps multiple workers safe.
pub(crate) fn start_local_worker(state: AppState) -> TaskHandle {
    let handle = tokio::spawn(async move {
        loop {
            let seen = state.queue().seq();
            match state.kernel().dequeue_one_queued_async().await {
                Ok(Some(job)) => run_job(&state, job).await,
                Ok(None) => state.queue().wait_for_change(seen, IDLE_WAIT).await,
                Err(e) => {
                    tracing::warn!(error = %e, "job dequeue failed");
                    tokio::time::sleep(IDLE_WAIT).await;
                }
            }
        }
    });
    TaskHandle::new("worker.local", handle)
}

pub(crate) async fn run_job(state: &AppState, job: JobRow) {
    let outcome = dispatch(state, &job).await;
    match outcome {
        Ok(()) => {
            if let Err(e) = state
                .kernel()
                .set_job_state_async(job.id.clone(), "completed".to_string(), None)
                .await
            {
                tracing::error!(job = %job.id, error = %e, "failed to finalize job");
                return;
            }
            state
                .publish(
                    foil_topics::TOPIC_JOBS_COMPLETED,
                    &json!({"job_id": job.id, "kind": job.kind}),
                )
                .await;
        }
        Err(e) => handle_failure(state, &job, e).await,
    }
}

async fn dispatch(state: &AppState, job: &JobRow) -> Result<()> {
    tracing::debug!(job = %job.id, kind = %job.kind, attempt = job.attempts, "running job");
    match job.kind.as_str() {
        "case.process" => process_case(state, job).await,
        "case.resume" => resume_case(state, job).await,
        "replay.dry" => {
            let run_id = payload_str(job, "run_id")?;
            replay::execute_dry(state, &run_id)
                .await
                .map_err(|e| anyhow!(e.to_string()))
        }
        "email.send" | "portal.sync" => deliver(state, job).await,
        other => Err(anyhow!("unknown job kind: {other}")),
    }
}

async fn handle_failure(state: &AppState, job: &JobRow, err: anyhow::Error) {
    let budget = max_attempts();
    if job.attempts < budget {
        tracing::warn!(
            job = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
            error = %err,
            "job failed; requeueing"
        );
        if let Err(e) = state.kernel().requeue_job_async(job.id.clone()).await {
            tracing::error!(job = %job.id, error = %e, "requeue failed");
        }
        state.queue().wake();
        return;
    }

    tracing::error!(
        job = %job.id,
        kind = %job.kind,
        attempts = job.attempts,
        error = %err,
        "job exhausted its attempts; dead-lettering"
    );
    let kernel = state.kernel();
    if let Err(e) = kernel
        .set_job_state_async(job.id.clone(), "dead".to_string(), Some(err.to_string()))
        .await
    {
        tracing::error!(job = %job.id, error = %e, "failed to mark job dead");
    }
    let dlq_id = uuid::Uuid::new_v4().to_string();
    let dlq_payload = json!({"job_id": job.id, "payload": job.payload});
    if let Err(e) = kernel
        .insert_dlq_async(
            dlq_id.clone(),
            job.kind.clone(),
            dlq_payload,
            err.to_string(),
        )
        .await
    {
        tracing::error!(job = %job.id, error = %e, "failed to dead-letter job");
    }
    state
        .publish(
            foil_topics::TOPIC_JOBS_DEAD,
            &json!({"job_id": job.id, "kind": job.kind, "error": err.to_string()}),
        )
        .await;
    state
        .publish(
            foil_topics::TOPIC_DLQ_RECORDED,
            &json!({"dlq_id": dlq_id, "queue": job.kind}),
        )
        .await;

    // A run whose work died is failed so the case's active slot frees up.
    if let Some(run_id) = job.payload.get("run_id").and_then(|v| v.as_str()) {
        if let Ok(Some(run)) = kernel.get_run_async(run_id.to_string()).await {
            if matches!(run.status.as_str(), "queued" | "running") {
                let _ = kernel
                    .set_run_status_async(
                        run_id.to_string(),
                        "failed".to_string(),
                        Some(format!("work dead-lettered: {err}")),
                    )
                    .await;
                state
                    .publish(
                        foil_topics::TOPIC_RUNS_FAILED,
                        &json!({"run_id": run_id, "case_id": run.case_id, "error": err.to_string()}),
                    )
                    .await;
            }
        }
    }
}

fn payload_str(job: &JobRow, key: &str) -> Result<String> {
    job.payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("job {} payload missing {key}", job.id))
}

/// Process a case run end to end: draft, validate, route.
async fn process_case(state: &AppState, job: &JobRow) -> Result<()> {
    let kernel = state.kernel();
    let run_id = payload_str(job, "run_id")?;
    let Some(run) = kernel.get_run_async(run_id.clone()).await? else {
        tracing::warn!(run = %run_id, "processing job for missing run; skipping");
        return Ok(());
    };
    // "running" admits our own redelivery after a crash mid-processing.
    if !matches!(run.status.as_str(), "queued" | "running") {
        tracing::info!(run = %run_id, status = %run.status, "run already settled; skipping");
        return Ok(());
    }
    kernel
        .set_run_status_async(run_id.clone(), "running".to_string(), None)
        .await?;
    state
        .publish(
            foil_topics::TOPIC_RUNS_RUNNING,
            &json!({"run_id": run_id, "case_id": run.case_id}),
        )
        .await;

    let case = kernel
        .get_case_async(run.case_id.clone())
        .await?
        .ok_or_else(|| anyhow!("case {} missing", run.case_id))?;
    if matches!(case.status.as_str(), "withdrawn" | "cancelled" | "closed") {
        kernel
            .set_run_status_async(run_id.clone(), "completed".to_string(), None)
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_COMPLETED,
                &json!({"run_id": run_id, "case_id": case.id, "note": "case is terminal"}),
            )
            .await;
        return Ok(());
    }

    let overrides: Overrides = job
        .payload
        .get("overrides")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .context("bad overrides in job payload")?
        .unwrap_or_default();

    let draft_input = json!({
        "case_id": case.id,
        "case_name": case.name,
        "trigger_type": run.trigger_type,
        "message_id": run.message_id,
        "context": job.payload.get("context"),
    });
    let raw = state
        .host()
        .invoke("draft.analyze", &draft_input)
        .await
        .context("draft provider failed")?;
    let draft: DraftOutcome = serde_json::from_value(raw).context("bad draft payload")?;
    let action = ActionType::parse(&draft.action_type)
        .ok_or_else(|| anyhow!("provider proposed unknown action {}", draft.action_type))?;

    let view = foil_policy::ProposalView {
        case_id: case.id.clone(),
        action_type: draft.action_type.clone(),
        confidence: overrides.confidence.unwrap_or(draft.confidence),
        risk_flags: draft.risk_flags.clone(),
        fee_amount: draft.fee_amount,
        autopilot_mode: overrides
            .autopilot_mode
            .clone()
            .unwrap_or_else(|| case.autopilot_mode.clone()),
    };
    let verdict = {
        let policy = state.policy();
        let guard = policy.lock().await;
        guard.validate(&view, &json!({"stage": "draft"}))
    };
    let disposition = decide::disposition(&case.autopilot_mode, &draft, &verdict, &overrides);

    match disposition {
        Disposition::Blocked { violations } => {
            let new = proposals::draft_to_proposal(
                &case.id,
                run.message_id.clone(),
                action,
                &draft,
                "blocked",
                false,
                Some("policy_blocked".into()),
                0,
            );
            let outcome = proposals::create_proposal(state, new)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            settle_run_with_proposal(state, &run_id, &case.id, outcome, "policy_blocked").await?;
            state
                .publish(
                    foil_topics::TOPIC_PROPOSALS_BLOCKED,
                    &json!({"case_id": case.id, "violations": violations}),
                )
                .await;
            Ok(())
        }
        Disposition::RequireHuman { pause_reason } => {
            let new = proposals::draft_to_proposal(
                &case.id,
                run.message_id.clone(),
                action,
                &draft,
                "pending_approval",
                false,
                Some(pause_reason.clone()),
                0,
            );
            let outcome = proposals::create_proposal(state, new)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            settle_run_with_proposal(state, &run_id, &case.id, outcome, &pause_reason).await
        }
        Disposition::AutoExecute => {
            let new = proposals::draft_to_proposal(
                &case.id,
                run.message_id.clone(),
                action,
                &draft,
                "pending_approval",
                true,
                None,
                0,
            );
            let outcome = proposals::create_proposal(state, new)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            if !outcome.created() {
                return settle_run_with_proposal(state, &run_id, &case.id, outcome, "reused").await;
            }
            let proposal_id = outcome.row().id.clone();
            kernel
                .set_run_proposal_async(run_id.clone(), proposal_id.clone())
                .await?;
            let recorded = kernel
                .record_decision_async(
                    proposal_id.clone(),
                    "pending_approval".to_string(),
                    "decision_received".to_string(),
                    "approve".to_string(),
                    None,
                    Some("auto-approved".to_string()),
                    Some("autopilot".to_string()),
                )
                .await?;
            if !recorded {
                return Err(anyhow!("autopilot decision raced on {proposal_id}"));
            }
            finish_run_with_execution(state, &run_id, &case.id, &proposal_id).await
        }
    }
}

/// Act on a recorded decision: deliver for approve, re-draft for adjust.
async fn resume_case(state: &AppState, job: &JobRow) -> Result<()> {
    let kernel = state.kernel();
    let run_id = payload_str(job, "run_id")?;
    let proposal_id = payload_str(job, "proposal_id")?;
    let decision = payload_str(job, "decision")?;
    let Some(run) = kernel.get_run_async(run_id.clone()).await? else {
        tracing::warn!(run = %run_id, "resume job for missing run; skipping");
        return Ok(());
    };
    if !matches!(run.status.as_str(), "queued" | "running") {
        tracing::info!(run = %run_id, status = %run.status, "resume already settled; skipping");
        return Ok(());
    }
    let proposal = kernel
        .get_proposal_async(proposal_id.clone())
        .await?
        .ok_or_else(|| anyhow!("proposal {proposal_id} missing"))?;
    let expected = match decision.as_str() {
        "approve" => "decision_received",
        "adjust" => "adjustment_requested",
        other => return Err(anyhow!("unknown decision {other} on resume")),
    };
    // The decision flip lands after the resume job is submitted, so a dequeue
    // can outrun it. Bouncing on the attempt budget waits the flip out instead
    // of acting on an undecided proposal and terminally failing the run.
    if proposal.status != expected {
        return Err(anyhow!(
            "proposal {} is {}, waiting for {expected}",
            proposal.id,
            proposal.status
        ));
    }
    kernel
        .set_run_status_async(run_id.clone(), "running".to_string(), None)
        .await?;
    state
        .publish(
            foil_topics::TOPIC_RUNS_RUNNING,
            &json!({"run_id": run_id, "case_id": run.case_id}),
        )
        .await;
    kernel
        .set_run_proposal_async(run_id.clone(), proposal_id.clone())
        .await?;

    match decision.as_str() {
        "approve" => finish_run_with_execution(state, &run_id, &run.case_id, &proposal_id).await,
        _ => {
            let prior = proposal;
            let instruction = job
                .payload
                .get("instruction")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let draft_input = json!({
                "case_id": run.case_id,
                "trigger_type": "resume",
                "instruction": instruction,
                "prior_draft": {
                    "action_type": prior.action_type,
                    "subject": prior.draft_subject,
                    "body": prior.draft_body,
                },
            });
            let raw = state
                .host()
                .invoke("draft.analyze", &draft_input)
                .await
                .context("re-draft provider failed")?;
            let draft: DraftOutcome = serde_json::from_value(raw).context("bad draft payload")?;
            let action = ActionType::parse(&draft.action_type)
                .ok_or_else(|| anyhow!("provider proposed unknown action {}", draft.action_type))?;
            let new = proposals::draft_to_proposal(
                &run.case_id,
                prior.trigger_message_id.clone(),
                action,
                &draft,
                "pending_approval",
                false,
                Some("awaiting_approval".into()),
                prior.adjustment_count + 1,
            );
            let outcome = proposals::create_proposal(state, new)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            settle_run_with_proposal(state, &run_id, &run.case_id, outcome, "awaiting_approval")
                .await
        }
    }
}

/// Pause the run on a freshly created proposal, or complete it when the open
/// proposal was reused.
async fn settle_run_with_proposal(
    state: &AppState,
    run_id: &str,
    case_id: &str,
    outcome: ProposalOutcome,
    pause_reason: &str,
) -> Result<()> {
    let kernel = state.kernel();
    let proposal_id = outcome.row().id.clone();
    kernel
        .set_run_proposal_async(run_id.to_string(), proposal_id.clone())
        .await?;
    if outcome.created() {
        kernel
            .set_run_status_async(run_id.to_string(), "paused".to_string(), None)
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_PAUSED,
                &json!({"run_id": run_id, "case_id": case_id, "proposal_id": proposal_id}),
            )
            .await;
        coordinator::transition_or_defer(
            state,
            case_id,
            CaseEvent::ReviewRequired {
                reason: pause_reason.to_string(),
            },
        )
        .await;
    } else {
        kernel
            .set_run_status_async(run_id.to_string(), "completed".to_string(), None)
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_COMPLETED,
                &json!({
                    "run_id": run_id,
                    "case_id": case_id,
                    "reused_proposal_id": proposal_id,
                }),
            )
            .await;
    }
    Ok(())
}

/// Execute a decided proposal and settle the run. Execution failures after
/// the claim do not bounce the job (a retry could not help: the claim is
/// held); the run fails and the case is flagged for an operator.
async fn finish_run_with_execution(
    state: &AppState,
    run_id: &str,
    case_id: &str,
    proposal_id: &str,
) -> Result<()> {
    let kernel = state.kernel();
    match execution::execute_approved(state, proposal_id).await {
        Ok(_) | Err(EngineError::AlreadyExecuted { .. }) => {
            kernel
                .set_run_status_async(run_id.to_string(), "completed".to_string(), None)
                .await?;
            state
                .publish(
                    foil_topics::TOPIC_RUNS_COMPLETED,
                    &json!({"run_id": run_id, "case_id": case_id, "proposal_id": proposal_id}),
                )
                .await;
            schedule_followup(state, case_id).await;
            Ok(())
        }
        Err(e) => {
            kernel
                .set_run_status_async(
                    run_id.to_string(),
                    "failed".to_string(),
                    Some(e.to_string()),
                )
                .await?;
            state
                .publish(
                    foil_topics::TOPIC_RUNS_FAILED,
                    &json!({"run_id": run_id, "case_id": case_id, "error": e.to_string()}),
                )
                .await;
            coordinator::transition_or_defer(
                state,
                case_id,
                CaseEvent::ReviewRequired {
                    reason: "execution_failed".into(),
                },
            )
            .await;
            Ok(())
        }
    }
}

async fn schedule_followup(state: &AppState, case_id: &str) {
    let days = env_u64("FOIL_FOLLOWUP_DAYS", 14);
    if days == 0 {
        return;
    }
    let next_due = (chrono::Utc::now() + chrono::Duration::days(days as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    coordinator::transition_or_defer(state, case_id, CaseEvent::FollowupScheduled { next_due })
        .await;
}

/// Deliver the side effect behind an execution claim through the provider
/// host. Provider failures bounce the job into the retry/DLQ machinery; the
/// claim's idempotency key keeps redelivery single-shot upstream.
async fn deliver(state: &AppState, job: &JobRow) -> Result<()> {
    let result = state
        .host()
        .invoke(&job.kind, &job.payload)
        .await
        .with_context(|| format!("{} delivery failed", job.kind))?;
    if let Some(case_id) = job.payload.get("case_id").and_then(|v| v.as_str()) {
        let description = match job.kind.as_str() {
            "email.send" => format!(
                "email sent: {}",
                job.payload
                    .get("subject")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(no subject)")
            ),
            _ => "portal action delivered".to_string(),
        };
        state
            .kernel()
            .append_activity_async(
                case_id.to_string(),
                "delivery".to_string(),
                description.clone(),
                Some(json!({"job_id": job.id, "result": result, "at": now_iso()})),
            )
            .await?;
        state
            .publish(
                foil_topics::TOPIC_CASES_ACTIVITY,
                &json!({"case_id": case_id, "event_type": "delivery", "description": description}),
            )
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runs::{self, StartRun};
    use crate::engine::{proposals::DecisionRequest, DecisionAction, TriggerType};
    use crate::test_support::TestHarness;

    async fn drain(h: &TestHarness) {
        // Run queued jobs to quiescence without the background loop.
        for _ in 0..32 {
            match h.state.kernel().dequeue_one_queued_async().await.unwrap() {
                Some(job) => run_job(&h.state, job).await,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn auto_case_runs_to_executed_proposal() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "auto").await;
        let run = runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::InitialRequest,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let done = h
            .state
            .kernel()
            .get_run_async(run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, "completed");
        let proposal_id = done.proposal_id.unwrap();
        let p = h
            .state
            .kernel()
            .get_proposal_async(proposal_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "executed");
        assert_eq!(p.decided_by.as_deref(), Some("autopilot"));
        assert_eq!(h.state.kernel().count_claims().unwrap(), 1);
        // The delivery job itself ran and logged activity.
        let activity = h
            .state
            .kernel()
            .list_activity_async("c1".to_string(), 50)
            .await
            .unwrap();
        assert!(activity
            .iter()
            .any(|a| a["event_type"].as_str() == Some("delivery")));
    }

    #[tokio::test]
    async fn supervised_case_pauses_for_review() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        let run = runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::InboundMessage,
                message_id: Some("m1".into()),
                context: json!({}),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let paused = h
            .state
            .kernel()
            .get_run_async(run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paused.status, "paused");
        let case = h
            .state
            .kernel()
            .get_case_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(case.requires_human);
        assert_eq!(case.pause_reason.as_deref(), Some("awaiting_approval"));
    }

    #[tokio::test]
    async fn approve_resume_executes_and_completes() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::InitialRequest,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let proposal = h
            .state
            .kernel()
            .find_open_proposal_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        let out = crate::engine::proposals::record_decision(
            &h.state,
            &proposal.id,
            DecisionRequest {
                action: DecisionAction::Approve,
                instruction: None,
                reason: None,
                decided_by: Some("analyst".into()),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let resume = h
            .state
            .kernel()
            .get_run_async(out.resume_run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resume.status, "completed");
        let executed = h
            .state
            .kernel()
            .get_proposal_async(proposal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executed.status, "executed");
        let case = h
            .state
            .kernel()
            .get_case_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(!case.requires_human);
        assert!(case.next_due.is_some());
    }

    #[tokio::test]
    async fn adjust_resume_creates_a_new_pending_proposal() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::InitialRequest,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let first = h
            .state
            .kernel()
            .find_open_proposal_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        crate::engine::proposals::record_decision(
            &h.state,
            &first.id,
            DecisionRequest {
                action: DecisionAction::Adjust,
                instruction: Some("mention the statutory deadline".into()),
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let second = h
            .state
            .kernel()
            .find_open_proposal_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, "pending_approval");
        assert_eq!(second.adjustment_count, first.adjustment_count + 1);
        let old = h
            .state
            .kernel()
            .get_proposal_async(first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, "adjustment_requested");
    }

    #[tokio::test]
    async fn resume_dequeued_before_the_decision_flip_waits_for_it() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        h.seed_pending_proposal("p1", "c1").await;
        h.state
            .kernel()
            .insert_run_async(
                "r-resume".to_string(),
                "c1".to_string(),
                "resume".to_string(),
                false,
                None,
                false,
                None,
                json!({"proposal_id": "p1", "decision": "approve"}),
            )
            .await
            .unwrap();
        h.state
            .facility()
            .submit(
                "case.resume",
                json!({
                    "case_id": "c1",
                    "run_id": "r-resume",
                    "proposal_id": "p1",
                    "decision": "approve",
                }),
                None,
            )
            .await
            .unwrap();
        // Dequeue ahead of the status flip: the job must bounce, not settle
        // the run against the still-pending proposal.
        let job = h
            .state
            .kernel()
            .dequeue_one_queued_async()
            .await
            .unwrap()
            .unwrap();
        run_job(&h.state, job).await;
        let run = h
            .state
            .kernel()
            .get_run_async("r-resume".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, "queued");
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "pending_approval");
        assert_eq!(h.state.kernel().count_claims().unwrap(), 0);
        // Once the flip lands, the requeued job carries the decision through.
        let flipped = h
            .state
            .kernel()
            .record_decision_async(
                "p1".to_string(),
                "pending_approval".to_string(),
                "decision_received".to_string(),
                "approve".to_string(),
                None,
                None,
                Some("analyst".to_string()),
            )
            .await
            .unwrap();
        assert!(flipped);
        drain(&h).await;
        let run = h
            .state
            .kernel()
            .get_run_async("r-resume".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, "completed");
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "executed");
    }

    #[tokio::test]
    async fn exhausted_job_lands_in_the_dlq_and_fails_its_run() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "auto").await;
        h.host.fail_capability("draft.analyze");
        let run = runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::InitialRequest,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        for _ in 0..max_attempts() {
            drain(&h).await;
        }
        let dead = h
            .state
            .kernel()
            .get_run_async(run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.status, "failed");
        let dlq = h
            .state
            .kernel()
            .list_dlq_async(None, None, 10)
            .await
            .unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].queue_name, "case.process");
        assert_eq!(dlq[0].resolution, "pending");
    }

    #[tokio::test]
    async fn duplicate_followup_trigger_reuses_the_open_proposal() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "supervised").await;
        let first = runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::FollowupTrigger,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        drain(&h).await;
        let open = h
            .state
            .kernel()
            .find_open_proposal_async("c1".to_string())
            .await
            .unwrap()
            .unwrap();
        // The paused first run still holds the slot; a decision resolves it.
        crate::engine::proposals::record_decision(
            &h.state,
            &open.id,
            DecisionRequest {
                action: DecisionAction::Dismiss,
                instruction: None,
                reason: None,
                decided_by: None,
            },
        )
        .await
        .unwrap();
        // Dismissed proposals close, so seed a fresh open one and re-trigger.
        h.seed_pending_proposal("p-open", "c1").await;
        let second = runs::start_run(
            &h.state,
            "c1",
            StartRun {
                trigger: TriggerType::FollowupTrigger,
                message_id: None,
                context: json!({}),
            },
        )
        .await
        .unwrap();
        assert_ne!(second.id, first.id);
        drain(&h).await;
        let done = h
            .state
            .kernel()
            .get_run_async(second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.proposal_id.as_deref(), Some("p-open"));
    }
}
