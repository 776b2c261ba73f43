use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use serde_json::json;

use foil_kernel::CaseRow;

use crate::app_state::AppState;
use crate::engine::error::EngineError;
use crate::engine::retry;

/// Per-case async locks. Every mutation of case-level fields funnels through
/// `transition`, so two concurrent updates to the same case serialize while
/// different cases proceed independently.
#[derive(Default)]
pub(crate) struct CaseLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CaseLocks {
    fn lock_for(&self, case_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(case_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the entry once nothing outside the map holds it, so the map
    /// tracks live contention instead of every case ever touched.
    fn release(&self, case_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if map
            .get(case_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(case_id);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Case-level state changes routed through the coordinator.
#[derive(Debug, Clone)]
pub enum CaseEvent {
    ReviewRequired { reason: String },
    ReviewCleared,
    Withdrawn { reason: Option<String> },
    PortalCancelled { note: Option<String> },
    FollowupScheduled { next_due: String },
    AutopilotChanged { mode: String },
}

impl CaseEvent {
    fn activity_type(&self) -> &'static str {
        match self {
            CaseEvent::ReviewRequired { .. } => "review_required",
            CaseEvent::ReviewCleared => "review_cleared",
            CaseEvent::Withdrawn { .. } => "case_withdrawn",
            CaseEvent::PortalCancelled { .. } => "portal_cancelled",
            CaseEvent::FollowupScheduled { .. } => "followup_scheduled",
            CaseEvent::AutopilotChanged { .. } => "autopilot_changed",
        }
    }

    fn description(&self) -> String {
        match self {
            CaseEvent::ReviewRequired { reason } => format!("paused for review: {reason}"),
            CaseEvent::ReviewCleared => "review cleared".into(),
            CaseEvent::Withdrawn { reason } => match reason {
                Some(r) => format!("case withdrawn: {r}"),
                None => "case withdrawn".into(),
            },
            CaseEvent::PortalCancelled { note } => match note {
                Some(n) => format!("portal request cancelled: {n}"),
                None => "portal request cancelled".into(),
            },
            CaseEvent::FollowupScheduled { next_due } => {
                format!("followup scheduled for {next_due}")
            }
            CaseEvent::AutopilotChanged { mode } => format!("autopilot set to {mode}"),
        }
    }

    fn field_updates(&self) -> serde_json::Value {
        match self {
            CaseEvent::ReviewRequired { reason } => {
                json!({"requires_human": true, "pause_reason": reason})
            }
            CaseEvent::ReviewCleared => {
                json!({"requires_human": false, "pause_reason": null})
            }
            CaseEvent::Withdrawn { .. } => {
                json!({"status": "withdrawn", "requires_human": false, "pause_reason": null, "next_due": null})
            }
            CaseEvent::PortalCancelled { .. } => {
                json!({"status": "cancelled", "last_portal_status": "cancelled", "requires_human": false, "pause_reason": null, "next_due": null})
            }
            CaseEvent::FollowupScheduled { next_due } => json!({"next_due": next_due}),
            CaseEvent::AutopilotChanged { mode } => json!({"autopilot_mode": mode}),
        }
    }
}

/// Apply a case event under the per-case lock. Fails fast with
/// `LockContention` when another transition holds the lock; callers that can
/// wait wrap this in `transition_with_retry`.
pub(crate) async fn transition(
    state: &AppState,
    case_id: &str,
    event: CaseEvent,
) -> Result<CaseRow, EngineError> {
    let lock = state.locks().lock_for(case_id);
    let guard = match lock.try_lock_owned() {
        Ok(g) => g,
        Err(_) => {
            state.locks().release(case_id);
            return Err(EngineError::LockContention);
        }
    };
    let out = apply(state, case_id, event).await;
    drop(guard);
    state.locks().release(case_id);
    out
}

pub(crate) async fn transition_with_retry(
    state: &AppState,
    case_id: &str,
    event: CaseEvent,
) -> Result<CaseRow, EngineError> {
    let state = state.clone();
    let case_id = case_id.to_string();
    retry::with_backoff(retry::lock_retry_max(), retry::lock_retry_base(), move || {
        let state = state.clone();
        let case_id = case_id.clone();
        let event = event.clone();
        async move { transition(&state, &case_id, event).await }
    })
    .await
}

/// Same as `transition_with_retry`, but a case that stays contended past the
/// retry budget is reconciled later by a detached task instead of failing the
/// caller. Worker paths use this so a busy lock never dead-letters a job.
pub(crate) async fn transition_or_defer(state: &AppState, case_id: &str, event: CaseEvent) {
    match transition_with_retry(state, case_id, event.clone()).await {
        Ok(_) => {}
        Err(EngineError::LockContention) => {
            let state = state.clone();
            let case_id = case_id.to_string();
            tracing::warn!(case = %case_id, "case lock contended; deferring reconcile");
            tokio::spawn(async move {
                let delay = crate::util::env_u64("FOIL_RECONCILE_DELAY_MS", 500);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                if let Err(e) = transition_with_retry(&state, &case_id, event).await {
                    tracing::error!(case = %case_id, error = %e, "deferred case reconcile failed");
                }
            });
        }
        Err(e) => {
            tracing::error!(case = %case_id, error = %e, "case transition failed");
        }
    }
}

async fn apply(state: &AppState, case_id: &str, event: CaseEvent) -> Result<CaseRow, EngineError> {
    let kernel = state.kernel();
    let existing = kernel
        .get_case_async(case_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("case {case_id}")))?;
    if matches!(event, CaseEvent::Withdrawn { .. } | CaseEvent::PortalCancelled { .. })
        && matches!(existing.status.as_str(), "withdrawn" | "cancelled")
    {
        // Terminal transitions are idempotent.
        return Ok(existing);
    }
    kernel
        .update_case_fields_async(case_id.to_string(), event.field_updates())
        .await?;
    if matches!(event, CaseEvent::Withdrawn { .. } | CaseEvent::PortalCancelled { .. }) {
        let cancelled = kernel.cancel_open_proposals_async(case_id.to_string()).await?;
        if cancelled > 0 {
            tracing::info!(case = %case_id, cancelled, "cancelled open proposals");
        }
    }
    kernel
        .append_activity_async(
            case_id.to_string(),
            event.activity_type().to_string(),
            event.description(),
            None,
        )
        .await?;
    state
        .publish(
            foil_topics::TOPIC_CASES_TRANSITIONED,
            &json!({
                "case_id": case_id,
                "event": event.activity_type(),
                "fields": event.field_updates(),
            }),
        )
        .await;
    let updated = kernel
        .get_case_async(case_id.to_string())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("case {case_id}")))?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn transition_updates_fields_and_logs_activity() {
        let h = TestHarness::new().await;
        h.seed_case("c1", "auto").await;
        let row = transition(
            &h.state,
            "c1",
            CaseEvent::ReviewRequired {
                reason: "low_confidence".into(),
            },
        )
        .await
        .unwrap();
        assert!(row.requires_human);
        assert_eq!(row.pause_reason.as_deref(), Some("low_confidence"));
        let activity = h
            .state
            .kernel()
            .list_activity_async("c1".to_string(), 10)
            .await
            .unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn contended_lock_reports_contention() {
        let h = TestHarness::new().await;
        h.seed_case("c2", "auto").await;
        let lock = h.state.locks().lock_for("c2");
        let _held = lock.lock().await;
        let err = transition(&h.state, "c2", CaseEvent::ReviewCleared)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockContention));
    }

    #[tokio::test]
    async fn retry_wins_after_the_lock_frees() {
        let h = TestHarness::new().await;
        h.seed_case("c3", "auto").await;
        let lock = h.state.locks().lock_for("c3");
        let held = lock.clone().lock_owned().await;
        let state = h.state.clone();
        let task = tokio::spawn(async move {
            transition_with_retry(&state, "c3", CaseEvent::ReviewCleared).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(held);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_entries_are_evicted_once_idle() {
        let h = TestHarness::new().await;
        h.seed_case("c5", "auto").await;
        transition(&h.state, "c5", CaseEvent::ReviewCleared)
            .await
            .unwrap();
        assert_eq!(h.state.locks().entry_count(), 0);
        // A holder outside the map keeps its entry alive.
        let lock = h.state.locks().lock_for("c5");
        let _held = lock.lock().await;
        assert_eq!(h.state.locks().entry_count(), 1);
    }

    #[tokio::test]
    async fn withdrawal_is_idempotent_and_cancels_open_proposals() {
        let h = TestHarness::new().await;
        h.seed_case("c4", "auto").await;
        h.seed_pending_proposal("p1", "c4").await;
        let row = transition(&h.state, "c4", CaseEvent::Withdrawn { reason: None })
            .await
            .unwrap();
        assert_eq!(row.status, "withdrawn");
        let p = h
            .state
            .kernel()
            .get_proposal_async("p1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.status, "cancelled");
        // Re-applying the terminal event changes nothing.
        let again = transition(&h.state, "c4", CaseEvent::Withdrawn { reason: None })
            .await
            .unwrap();
        assert_eq!(again.status, "withdrawn");
    }
}
