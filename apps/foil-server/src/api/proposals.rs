use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::engine::error::EngineError;
use crate::engine::execution;
use crate::engine::proposals::{self, DecisionRequest};
use crate::engine::DecisionAction;
use crate::responses;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ListProposalsQuery {
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List proposals, newest first.
#[utoipa::path(
    get,
    path = "/proposals",
    tag = "proposals",
    params(
        ("case_id" = Option<String>, Query, description = "Filter by case"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("limit" = Option<i64>, Query, description = "Max rows")
    ),
    responses((status = 200, description = "Proposals"))
)]
pub(crate) async fn list_proposals(
    State(state): State<AppState>,
    Query(q): Query<ListProposalsQuery>,
) -> Response {
    match state
        .kernel()
        .list_proposals_async(q.case_id, q.status, q.limit.unwrap_or(100).clamp(1, 1000))
        .await
    {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

/// Fetch one proposal.
#[utoipa::path(
    get,
    path = "/proposals/{id}",
    tag = "proposals",
    params(("id" = String, Path, description = "Proposal id")),
    responses(
        (status = 200, description = "Proposal"),
        (status = 404, description = "Missing", content_type = "application/problem+json")
    )
)]
pub(crate) async fn get_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.kernel().get_proposal_async(id.clone()).await {
        Ok(Some(p)) => Json(json!(p)).into_response(),
        Ok(None) => responses::problem_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            Some(&format!("proposal {id}")),
        ),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct DecisionReq {
    pub action: DecisionAction,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

/// Record a human decision on an open proposal.
#[utoipa::path(
    post,
    path = "/proposals/{id}/decision",
    tag = "proposals",
    request_body = DecisionReq,
    params(("id" = String, Path, description = "Proposal id")),
    responses(
        (status = 200, description = "Decision recorded"),
        (status = 404, description = "Missing", content_type = "application/problem+json"),
        (status = 409, description = "Stale or conflicting", content_type = "application/problem+json"),
        (status = 502, description = "Resume submission failed", content_type = "application/problem+json")
    )
)]
pub(crate) async fn decide(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionReq>,
) -> Response {
    match proposals::record_decision(
        &state,
        &id,
        DecisionRequest {
            action: req.action,
            instruction: req.instruction,
            reason: req.reason,
            decided_by: req.decided_by,
        },
    )
    .await
    {
        Ok(out) => Json(json!({
            "proposal": out.proposal,
            "resume_run_id": out.resume_run_id,
        }))
        .into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

/// Execute a decided proposal's side effect. Safe to call repeatedly: a
/// proposal that already executed reports its original receipt.
#[utoipa::path(
    post,
    path = "/proposals/{id}/execute",
    tag = "proposals",
    params(("id" = String, Path, description = "Proposal id")),
    responses(
        (status = 200, description = "Executed (or already executed)"),
        (status = 403, description = "Policy blocked", content_type = "application/problem+json"),
        (status = 409, description = "Not decided", content_type = "application/problem+json"),
        (status = 502, description = "Delivery submission failed", content_type = "application/problem+json")
    )
)]
pub(crate) async fn execute(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match execution::execute_approved(&state, &id).await {
        Ok(receipt) => Json(json!({
            "proposal_id": receipt.proposal_id,
            "execution_key": receipt.execution_key,
            "job_id": receipt.job_id,
            "already_executed": false,
        }))
        .into_response(),
        Err(EngineError::AlreadyExecuted {
            executed_at,
            job_id,
        }) => Json(json!({
            "proposal_id": id,
            "executed_at": executed_at,
            "job_id": job_id,
            "already_executed": true,
        }))
        .into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}
