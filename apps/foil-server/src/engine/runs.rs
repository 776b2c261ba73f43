use serde_json::{json, Value};

use foil_kernel::RunRow;

use crate::app_state::AppState;
use crate::engine::error::EngineError;
use crate::engine::TriggerType;

pub(crate) struct StartRun {
    pub trigger: TriggerType,
    pub message_id: Option<String>,
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    DryRun,
    Live,
}

/// Start a new run for a case. At most one run per case may be active
/// (queued, running or paused); a loser of that race gets a `Conflict`
/// naming the winner.
pub(crate) async fn start_run(
    state: &AppState,
    case_id: &str,
    req: StartRun,
) -> Result<RunRow, EngineError> {
    let kernel = state.kernel();
    kernel
        .get_case_async(case_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("case {case_id}")))?;
    if let Some(active) = kernel.find_active_run_async(case_id.to_string()).await? {
        return Err(EngineError::Conflict {
            case_id: case_id.to_string(),
            active_run_id: active.id,
            status: active.status,
        });
    }
    let run_id = uuid::Uuid::new_v4().to_string();
    let metadata = json!({"context": req.context});
    let inserted = kernel
        .insert_run_async(
            run_id.clone(),
            case_id.to_string(),
            req.trigger.as_str().to_string(),
            false,
            None,
            false,
            req.message_id.clone(),
            metadata,
        )
        .await?;
    if !inserted {
        // Lost the insert race to a concurrent start.
        let active = kernel.find_active_run_async(case_id.to_string()).await?;
        return match active {
            Some(a) => Err(EngineError::Conflict {
                case_id: case_id.to_string(),
                active_run_id: a.id,
                status: a.status,
            }),
            None => Err(EngineError::Internal(anyhow::anyhow!(
                "run insert rejected without a visible active run"
            ))),
        };
    }
    state
        .publish(
            foil_topics::TOPIC_RUNS_CREATED,
            &json!({"run_id": run_id, "case_id": case_id, "trigger_type": req.trigger.as_str()}),
        )
        .await;
    submit_run_job(
        state,
        case_id,
        &run_id,
        "case.process",
        json!({
            "case_id": case_id,
            "run_id": run_id,
            "trigger_type": req.trigger.as_str(),
            "message_id": req.message_id,
            "context": req.context,
        }),
    )
    .await?;
    kernel
        .get_run_async(run_id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
}

/// Replay an earlier run, either as a pure simulation (dry run) or as a real
/// re-execution. Replays occupy the case's active-run slot like any other run.
pub(crate) async fn replay_run(
    state: &AppState,
    source_run_id: &str,
    mode: ReplayMode,
    overrides: Value,
) -> Result<RunRow, EngineError> {
    let kernel = state.kernel();
    let source = kernel
        .get_run_async(source_run_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {source_run_id}")))?;
    if let Some(active) = kernel.find_active_run_async(source.case_id.clone()).await? {
        return Err(EngineError::Conflict {
            case_id: source.case_id,
            active_run_id: active.id,
            status: active.status,
        });
    }
    let dry_run = mode == ReplayMode::DryRun;
    let run_id = uuid::Uuid::new_v4().to_string();
    let metadata = json!({"overrides": overrides});
    let inserted = kernel
        .insert_run_async(
            run_id.clone(),
            source.case_id.clone(),
            TriggerType::Replay.as_str().to_string(),
            true,
            Some(source_run_id.to_string()),
            dry_run,
            source.message_id.clone(),
            metadata,
        )
        .await?;
    if !inserted {
        let active = kernel.find_active_run_async(source.case_id.clone()).await?;
        return match active {
            Some(a) => Err(EngineError::Conflict {
                case_id: source.case_id,
                active_run_id: a.id,
                status: a.status,
            }),
            None => Err(EngineError::Internal(anyhow::anyhow!(
                "replay insert rejected without a visible active run"
            ))),
        };
    }
    state
        .publish(
            foil_topics::TOPIC_RUNS_CREATED,
            &json!({
                "run_id": run_id,
                "case_id": source.case_id,
                "trigger_type": "replay",
                "replay_of": source_run_id,
                "dry_run": dry_run,
            }),
        )
        .await;
    let kind = if dry_run { "replay.dry" } else { "case.process" };
    submit_run_job(
        state,
        &source.case_id,
        &run_id,
        kind,
        json!({
            "case_id": source.case_id,
            "run_id": run_id,
            "replay_of_run_id": source_run_id,
            "trigger_type": "replay",
            "dry_run": dry_run,
            "overrides": overrides,
        }),
    )
    .await?;
    kernel
        .get_run_async(run_id.clone())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
}

/// Cancel a run that has not reached a terminal state.
pub(crate) async fn cancel_run(
    state: &AppState,
    run_id: &str,
    reason: Option<&str>,
) -> Result<RunRow, EngineError> {
    let kernel = state.kernel();
    let run = kernel
        .get_run_async(run_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
    if matches!(run.status.as_str(), "completed" | "failed") {
        return Err(EngineError::StaleState {
            expected: "queued|running|paused".into(),
            current: run.status,
        });
    }
    let reason = reason.unwrap_or("cancelled by operator");
    kernel
        .set_run_status_async(run_id.to_string(), "failed".to_string(), Some(reason.to_string()))
        .await?;
    state
        .publish(
            foil_topics::TOPIC_RUNS_CANCELLED,
            &json!({"run_id": run_id, "case_id": run.case_id, "reason": reason}),
        )
        .await;
    kernel
        .append_activity_async(
            run.case_id.clone(),
            "run_cancelled".to_string(),
            format!("run {run_id} cancelled: {reason}"),
            None,
        )
        .await?;
    kernel
        .get_run_async(run_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
}

/// Resubmit a settled run's work as a fresh run with the original trigger.
/// Retrying while the case has an active run (the source run included) is a
/// `Conflict`; the run being retried carries no other precondition.
pub(crate) async fn retry_run(state: &AppState, run_id: &str) -> Result<RunRow, EngineError> {
    let kernel = state.kernel();
    let run = kernel
        .get_run_async(run_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
    let trigger = TriggerType::parse(&run.trigger_type).unwrap_or(TriggerType::Manual);
    let context = run
        .metadata
        .get("context")
        .cloned()
        .unwrap_or(Value::Null);
    start_run(
        state,
        &run.case_id,
        StartRun {
            trigger,
            message_id: run.message_id.clone(),
            context,
        },
    )
    .await
}

/// Mark a run failed when its work cannot be enqueued, then surface the
/// submission failure. The run is terminal so the active slot frees up.
async fn submit_run_job(
    state: &AppState,
    case_id: &str,
    run_id: &str,
    kind: &str,
    payload: Value,
) -> Result<(), EngineError> {
    match state.facility().submit(kind, payload, None).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let detail = e.to_string();
            state
                .kernel()
                .set_run_status_async(
                    run_id.to_string(),
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
            Err(EngineError::Submission(detail))
        }
    }
}
