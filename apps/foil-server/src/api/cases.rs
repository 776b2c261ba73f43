use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::engine::coordinator::{self, CaseEvent};
use crate::responses;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateCaseReq {
    /// Client-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// `auto`, `supervised` or `manual`; defaults to supervised.
    #[serde(default)]
    pub autopilot_mode: Option<String>,
}

/// Create a case.
#[utoipa::path(
    post,
    path = "/cases",
    tag = "cases",
    request_body = CreateCaseReq,
    responses(
        (status = 201, description = "Created"),
        (status = 400, description = "Invalid", content_type = "application/problem+json")
    )
)]
pub(crate) async fn create_case(
    State(state): State<AppState>,
    Json(req): Json<CreateCaseReq>,
) -> Response {
    let mode = req.autopilot_mode.as_deref().unwrap_or("supervised");
    if !matches!(mode, "auto" | "supervised" | "manual") {
        return responses::problem_response(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            Some("autopilot_mode must be auto, supervised or manual"),
        );
    }
    let id = req
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if let Err(e) = state
        .kernel()
        .insert_case_async(
            id.clone(),
            req.name.clone(),
            "active".to_string(),
            mode.to_string(),
        )
        .await
    {
        return responses::internal_error(Some(&e.to_string()));
    }
    match state.kernel().get_case_async(id).await {
        Ok(Some(case)) => (StatusCode::CREATED, Json(json!(case))).into_response(),
        Ok(None) => responses::internal_error(Some("case vanished after insert")),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ListCasesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List cases.
#[utoipa::path(
    get,
    path = "/cases",
    tag = "cases",
    params(("limit" = Option<i64>, Query, description = "Max rows")),
    responses((status = 200, description = "Cases"))
)]
pub(crate) async fn list_cases(
    State(state): State<AppState>,
    Query(q): Query<ListCasesQuery>,
) -> Response {
    match state
        .kernel()
        .list_cases_async(q.limit.unwrap_or(100).clamp(1, 1000))
        .await
    {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

/// Fetch one case.
#[utoipa::path(
    get,
    path = "/cases/{id}",
    tag = "cases",
    params(("id" = String, Path, description = "Case id")),
    responses(
        (status = 200, description = "Case"),
        (status = 404, description = "Missing", content_type = "application/problem+json")
    )
)]
pub(crate) async fn get_case(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.kernel().get_case_async(id.clone()).await {
        Ok(Some(case)) => Json(json!(case)).into_response(),
        Ok(None) => responses::problem_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            Some(&format!("case {id}")),
        ),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

/// Case activity log, newest first.
#[utoipa::path(
    get,
    path = "/cases/{id}/activity",
    tag = "cases",
    params(("id" = String, Path, description = "Case id")),
    responses((status = 200, description = "Activity entries"))
)]
pub(crate) async fn case_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.kernel().list_activity_async(id, 200).await {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct WithdrawReq {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Withdraw a case: open proposals are cancelled and the case goes terminal.
#[utoipa::path(
    post,
    path = "/cases/{id}/withdraw",
    tag = "cases",
    request_body = WithdrawReq,
    params(("id" = String, Path, description = "Case id")),
    responses(
        (status = 200, description = "Withdrawn"),
        (status = 404, description = "Missing", content_type = "application/problem+json"),
        (status = 503, description = "Lock contended", content_type = "application/problem+json")
    )
)]
pub(crate) async fn withdraw_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WithdrawReq>,
) -> Response {
    match coordinator::transition_with_retry(&state, &id, CaseEvent::Withdrawn { reason: req.reason })
        .await
    {
        Ok(case) => Json(json!(case)).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct PortalCancelReq {
    #[serde(default)]
    pub note: Option<String>,
}

/// Record that the request was cancelled at the agency portal.
#[utoipa::path(
    post,
    path = "/cases/{id}/portal_cancel",
    tag = "cases",
    request_body = PortalCancelReq,
    params(("id" = String, Path, description = "Case id")),
    responses(
        (status = 200, description = "Cancelled"),
        (status = 404, description = "Missing", content_type = "application/problem+json")
    )
)]
pub(crate) async fn portal_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PortalCancelReq>,
) -> Response {
    match coordinator::transition_with_retry(&state, &id, CaseEvent::PortalCancelled { note: req.note })
        .await
    {
        Ok(case) => Json(json!(case)).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct AutopilotReq {
    pub mode: String,
}

/// Switch a case's autopilot mode.
#[utoipa::path(
    post,
    path = "/cases/{id}/autopilot",
    tag = "cases",
    request_body = AutopilotReq,
    params(("id" = String, Path, description = "Case id")),
    responses(
        (status = 200, description = "Updated"),
        (status = 400, description = "Invalid", content_type = "application/problem+json")
    )
)]
pub(crate) async fn set_autopilot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AutopilotReq>,
) -> Response {
    if !matches!(req.mode.as_str(), "auto" | "supervised" | "manual") {
        return responses::problem_response(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            Some("mode must be auto, supervised or manual"),
        );
    }
    match coordinator::transition_with_retry(&state, &id, CaseEvent::AutopilotChanged { mode: req.mode })
        .await
    {
        Ok(case) => Json(json!(case)).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}
