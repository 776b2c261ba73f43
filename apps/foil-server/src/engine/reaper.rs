use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::engine::error::EngineError;
use crate::tasks::TaskHandle;
use crate::util::{env_u64, now_iso};

/// Last sweep summary, surfaced by the reaper status endpoint.
#[derive(Default)]
pub(crate) struct ReaperStatus {
    last: Mutex<Option<Value>>,
}

impl ReaperStatus {
    pub fn record(&self, summary: Value) {
        if let Ok(mut g) = self.last.lock() {
            *g = Some(summary);
        }
    }

    pub fn last_sweep(&self) -> Option<Value> {
        self.last.lock().ok().and_then(|g| g.clone())
    }
}

pub(crate) fn stale_cutoff(stale_secs: u64) -> String {
    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(stale_secs as i64);
    cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Force terminal state onto runs and jobs that have sat in a live state past
/// the staleness threshold, leaving an audit row per target. Selecting only
/// live rows makes the sweep idempotent: a second pass finds nothing.
pub(crate) async fn sweep(state: &AppState) -> Result<Value, EngineError> {
    let stale_secs = env_u64("FOIL_REAPER_STALE_SECS", 3600);
    let cutoff = stale_cutoff(stale_secs);
    let kernel = state.kernel();
    let reason = format!("stale beyond {stale_secs}s");

    let mut runs_failed = 0u64;
    for run in kernel.list_stale_runs_async(cutoff.clone()).await? {
        let previous = run.status.clone();
        kernel
            .set_run_status_async(run.id.clone(), "failed".to_string(), Some(reason.clone()))
            .await?;
        kernel
            .append_reaper_audit_async(
                "run".to_string(),
                run.id.clone(),
                previous,
                "failed".to_string(),
                reason.clone(),
            )
            .await?;
        state
            .publish(
                foil_topics::TOPIC_RUNS_FAILED,
                &json!({"run_id": run.id, "case_id": run.case_id, "error": reason, "reaped": true}),
            )
            .await;
        runs_failed += 1;
    }

    let mut jobs_failed = 0u64;
    for job in kernel.list_stale_jobs_async(cutoff.clone()).await? {
        kernel
            .set_job_state_async(job.id.clone(), "failed".to_string(), Some(reason.clone()))
            .await?;
        kernel
            .append_reaper_audit_async(
                "job".to_string(),
                job.id.clone(),
                "running".to_string(),
                "failed".to_string(),
                reason.clone(),
            )
            .await?;
        jobs_failed += 1;
    }

    let summary = json!({
        "swept_at": now_iso(),
        "cutoff": cutoff,
        "stale_secs": stale_secs,
        "runs_failed": runs_failed,
        "jobs_failed": jobs_failed,
    });
    state.reaper_status().record(summary.clone());
    state
        .publish(foil_topics::TOPIC_REAPER_SWEPT, &summary)
        .await;
    Ok(summary)
}

/// Periodic sweep. `FOIL_REAPER_INTERVAL_SECS=0` disables the loop entirely
/// (bootstrap checks before spawning); manual sweeps remain available.
pub(crate) fn interval_secs() -> u64 {
    env_u64("FOIL_REAPER_INTERVAL_SECS", 300)
}

pub(crate) fn start(state: AppState, interval: u64) -> TaskHandle {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep(&state).await {
                Ok(summary) => tracing::debug!(%summary, "reaper sweep finished"),
                Err(e) => tracing::warn!(error = %e, "reaper sweep failed"),
            }
        }
    });
    TaskHandle::new("engine.reaper", handle)
}
