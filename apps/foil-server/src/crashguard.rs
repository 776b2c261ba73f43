use std::path::PathBuf;

use serde_json::json;

use crate::app_state::AppState;
use crate::util::{now_iso, state_dir};

fn marker_path() -> PathBuf {
    state_dir().join("crash.marker")
}

/// Install a panic hook that drops a marker file so the next boot knows the
/// previous process died uncleanly.
pub(crate) fn install() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = std::fs::create_dir_all(state_dir());
        let _ = std::fs::write(
            marker_path(),
            format!("{}\n{}\n", now_iso(), info),
        );
        previous(info);
    }));
}

/// Boot-time recovery: requeue jobs a dead process left in `running` and
/// report whether the last shutdown crashed.
pub(crate) async fn sweep_on_start(state: &AppState) {
    let marker = marker_path();
    let crashed = marker.exists();
    if crashed {
        tracing::warn!(path = %marker.display(), "previous process crashed; recovering");
        let _ = std::fs::remove_file(&marker);
    }

    let kernel = state.kernel();
    let cutoff = now_iso();
    match kernel.list_stale_jobs_async(cutoff).await {
        Ok(orphans) => {
            for job in &orphans {
                if let Err(e) = kernel.requeue_job_async(job.id.clone()).await {
                    tracing::error!(job = %job.id, error = %e, "failed to requeue orphaned job");
                }
            }
            if !orphans.is_empty() {
                tracing::info!(count = orphans.len(), "requeued orphaned jobs");
                state.queue().wake();
            }
        }
        Err(e) => tracing::error!(error = %e, "orphan sweep failed"),
    }

    state
        .publish(
            foil_topics::TOPIC_SERVICE_HEALTH,
            &json!({"boot": true, "recovered_from_crash": crashed}),
        )
        .await;
}
