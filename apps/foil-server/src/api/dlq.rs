use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::responses;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ListDlqQuery {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List dead-letter items.
#[utoipa::path(
    get,
    path = "/dlq",
    tag = "dlq",
    params(
        ("queue" = Option<String>, Query, description = "Filter by source queue"),
        ("resolution" = Option<String>, Query, description = "pending, retried or discarded"),
        ("limit" = Option<i64>, Query, description = "Max rows")
    ),
    responses((status = 200, description = "Dead letters"))
)]
pub(crate) async fn list_dlq(
    State(state): State<AppState>,
    Query(q): Query<ListDlqQuery>,
) -> Response {
    match state
        .kernel()
        .list_dlq_async(q.queue, q.resolution, q.limit.unwrap_or(100).clamp(1, 1000))
        .await
    {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

/// Resubmit a fresh job from a pending dead letter's stored payload. The
/// original dead job stays dead as the audit trail; the fresh job gets a full
/// attempt budget. Resolving twice is a 409; the first resolution wins.
#[utoipa::path(
    post,
    path = "/dlq/{id}/retry",
    tag = "dlq",
    params(("id" = String, Path, description = "Dead letter id")),
    responses(
        (status = 200, description = "Fresh job submitted"),
        (status = 404, description = "Missing", content_type = "application/problem+json"),
        (status = 409, description = "Already resolved", content_type = "application/problem+json"),
        (status = 502, description = "Submission failed", content_type = "application/problem+json")
    )
)]
pub(crate) async fn retry_dlq(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let kernel = state.kernel();
    let item = match kernel.get_dlq_async(id.clone()).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            return responses::problem_response(
                StatusCode::NOT_FOUND,
                "Not Found",
                Some(&format!("dead letter {id}")),
            )
        }
        Err(e) => return responses::internal_error(Some(&e.to_string())),
    };
    match kernel
        .set_dlq_resolution_async(id.clone(), "retried".to_string(), None)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return responses::problem_response(
                StatusCode::CONFLICT,
                "Already Resolved",
                Some(&format!("dead letter {id} is {}", item.resolution)),
            )
        }
        Err(e) => return responses::internal_error(Some(&e.to_string())),
    }
    let payload = item
        .payload
        .get("payload")
        .cloned()
        .unwrap_or_else(|| item.payload.clone());
    match state.facility().submit(&item.queue_name, payload, None).await {
        Ok(handle) => {
            state
                .publish(
                    foil_topics::TOPIC_DLQ_RETRIED,
                    &json!({"dlq_id": id, "job_id": handle.job_id}),
                )
                .await;
            Json(json!({"id": id, "resolution": "retried", "job_id": handle.job_id}))
                .into_response()
        }
        Err(e) => responses::problem_response(
            StatusCode::BAD_GATEWAY,
            "Submission Failed",
            Some(&e.to_string()),
        ),
    }
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub(crate) struct DiscardQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Discard a pending dead letter, recording the operator's reason.
#[utoipa::path(
    post,
    path = "/dlq/{id}/discard",
    tag = "dlq",
    params(
        ("id" = String, Path, description = "Dead letter id"),
        ("reason" = Option<String>, Query, description = "Why the item is dropped")
    ),
    responses(
        (status = 200, description = "Discarded"),
        (status = 404, description = "Missing", content_type = "application/problem+json"),
        (status = 409, description = "Already resolved", content_type = "application/problem+json")
    )
)]
pub(crate) async fn discard_dlq(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DiscardQuery>,
) -> Response {
    let kernel = state.kernel();
    let item = match kernel.get_dlq_async(id.clone()).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            return responses::problem_response(
                StatusCode::NOT_FOUND,
                "Not Found",
                Some(&format!("dead letter {id}")),
            )
        }
        Err(e) => return responses::internal_error(Some(&e.to_string())),
    };
    match kernel
        .set_dlq_resolution_async(id.clone(), "discarded".to_string(), q.reason.clone())
        .await
    {
        Ok(true) => {
            state
                .publish(
                    foil_topics::TOPIC_DLQ_DISCARDED,
                    &json!({"dlq_id": id, "reason": q.reason}),
                )
                .await;
            Json(json!({"id": id, "resolution": "discarded", "reason": q.reason}))
                .into_response()
        }
        Ok(false) => responses::problem_response(
            StatusCode::CONFLICT,
            "Already Resolved",
            Some(&format!("dead letter {id} is {}", item.resolution)),
        ),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn retry_submits_a_fresh_job_with_a_full_budget() {
        let h = TestHarness::new().await;
        h.state
            .kernel()
            .insert_dlq_async(
                "d1".to_string(),
                "email.send".to_string(),
                json!({"job_id": "j-dead", "payload": {"case_id": "c1", "subject": "Re: request"}}),
                "smtp timeout".to_string(),
            )
            .await
            .unwrap();
        let resp = retry_dlq(State(h.state.clone()), Path("d1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let item = h
            .state
            .kernel()
            .get_dlq_async("d1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.resolution, "retried");
        // The stored payload came back as a brand new job at attempt one.
        let job = h
            .state
            .kernel()
            .dequeue_one_queued_async()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.kind, "email.send");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload["case_id"], json!("c1"));
        // Second resolution attempt conflicts.
        let again = retry_dlq(State(h.state.clone()), Path("d1".to_string())).await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn discard_records_the_reason() {
        let h = TestHarness::new().await;
        h.state
            .kernel()
            .insert_dlq_async(
                "d1".to_string(),
                "portal.sync".to_string(),
                json!({"payload": {}}),
                "portal 500".to_string(),
            )
            .await
            .unwrap();
        let resp = discard_dlq(
            State(h.state.clone()),
            Path("d1".to_string()),
            Query(DiscardQuery {
                reason: Some("portal decommissioned".to_string()),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let item = h
            .state
            .kernel()
            .get_dlq_async("d1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.resolution, "discarded");
        assert_eq!(
            item.resolution_note.as_deref(),
            Some("portal decommissioned")
        );
    }
}
