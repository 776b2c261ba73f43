use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::engine::runs::{self, ReplayMode, StartRun};
use crate::engine::TriggerType;
use crate::responses;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct StartRunReq {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Start a run for a case. Conflicts (409) name the active run.
#[utoipa::path(
    post,
    path = "/cases/{id}/runs",
    tag = "runs",
    request_body = StartRunReq,
    params(("id" = String, Path, description = "Case id")),
    responses(
        (status = 201, description = "Run queued"),
        (status = 404, description = "Missing case", content_type = "application/problem+json"),
        (status = 409, description = "Active run exists", content_type = "application/problem+json"),
        (status = 502, description = "Submission failed", content_type = "application/problem+json")
    )
)]
pub(crate) async fn start_run(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(req): Json<StartRunReq>,
) -> Response {
    if req.trigger_type == TriggerType::Replay {
        return responses::problem_response(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            Some("replay runs are started via /runs/{id}/replay"),
        );
    }
    match runs::start_run(
        &state,
        &case_id,
        StartRun {
            trigger: req.trigger_type,
            message_id: req.message_id,
            context: req.context.unwrap_or_else(|| json!({})),
        },
    )
    .await
    {
        Ok(run) => (StatusCode::CREATED, Json(json!(run))).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ListRunsQuery {
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List runs, newest first.
#[utoipa::path(
    get,
    path = "/runs",
    tag = "runs",
    params(
        ("case_id" = Option<String>, Query, description = "Filter by case"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("limit" = Option<i64>, Query, description = "Max rows")
    ),
    responses((status = 200, description = "Runs"))
)]
pub(crate) async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> Response {
    match state
        .kernel()
        .list_runs_async(q.case_id, q.status, q.limit.unwrap_or(100).clamp(1, 1000))
        .await
    {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

/// Fetch one run.
#[utoipa::path(
    get,
    path = "/runs/{id}",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run"),
        (status = 404, description = "Missing", content_type = "application/problem+json")
    )
)]
pub(crate) async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.kernel().get_run_async(id.clone()).await {
        Ok(Some(run)) => Json(json!(run)).into_response(),
        Ok(None) => responses::problem_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            Some(&format!("run {id}")),
        ),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct CancelRunReq {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Cancel a live run, freeing the case's active slot.
#[utoipa::path(
    post,
    path = "/runs/{id}/cancel",
    tag = "runs",
    request_body = CancelRunReq,
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Cancelled"),
        (status = 409, description = "Already terminal", content_type = "application/problem+json")
    )
)]
pub(crate) async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CancelRunReq>,
) -> Response {
    match runs::cancel_run(&state, &id, req.reason.as_deref()).await {
        Ok(run) => Json(json!(run)).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

/// Resubmit a settled run's work under a fresh run id.
#[utoipa::path(
    post,
    path = "/runs/{id}/retry",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 201, description = "Retry queued"),
        (status = 409, description = "Case has an active run", content_type = "application/problem+json")
    )
)]
pub(crate) async fn retry_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match runs::retry_run(&state, &id).await {
        Ok(run) => (StatusCode::CREATED, Json(json!(run))).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ReplayReq {
    /// `dry_run` (default) simulates without side effects; `live` re-executes.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub overrides: Option<serde_json::Value>,
}

/// Replay an earlier run.
#[utoipa::path(
    post,
    path = "/runs/{id}/replay",
    tag = "runs",
    request_body = ReplayReq,
    params(("id" = String, Path, description = "Source run id")),
    responses(
        (status = 201, description = "Replay queued"),
        (status = 404, description = "Missing run", content_type = "application/problem+json"),
        (status = 409, description = "Active run exists", content_type = "application/problem+json")
    )
)]
pub(crate) async fn replay_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReplayReq>,
) -> Response {
    let mode = match req.mode.as_deref() {
        None | Some("dry_run") => ReplayMode::DryRun,
        Some("live") => ReplayMode::Live,
        Some(other) => {
            return responses::problem_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                Some(&format!("unknown replay mode {other}")),
            )
        }
    };
    match runs::replay_run(&state, &id, mode, req.overrides.unwrap_or_else(|| json!({}))).await {
        Ok(run) => (StatusCode::CREATED, Json(json!(run))).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

/// Fetch the diff produced by a completed dry-run replay.
#[utoipa::path(
    get,
    path = "/runs/{id}/replay",
    tag = "runs",
    params(("id" = String, Path, description = "Replay run id")),
    responses(
        (status = 200, description = "Replay diff"),
        (status = 404, description = "No diff available", content_type = "application/problem+json")
    )
)]
pub(crate) async fn replay_diff(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.kernel().get_run_async(id.clone()).await {
        Ok(Some(run)) => match run.metadata.get("replay") {
            Some(diff) => Json(json!({
                "run_id": run.id,
                "status": run.status,
                "diff": diff,
            }))
            .into_response(),
            None => responses::problem_response(
                StatusCode::NOT_FOUND,
                "Not Found",
                Some("run has no replay diff (not a finished dry run?)"),
            ),
        },
        Ok(None) => responses::problem_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            Some(&format!("run {id}")),
        ),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}
