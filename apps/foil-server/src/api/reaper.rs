use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::app_state::AppState;
use crate::engine::reaper;
use crate::responses;

/// Reaper status: configuration and the last sweep's summary.
#[utoipa::path(
    get,
    path = "/reaper",
    tag = "reaper",
    responses((status = 200, description = "Reaper status"))
)]
pub(crate) async fn status(State(state): State<AppState>) -> Response {
    let audit = state
        .kernel()
        .list_reaper_audit_async(50)
        .await
        .unwrap_or_default();
    Json(json!({
        "interval_secs": reaper::interval_secs(),
        "last_sweep": state.reaper_status().last_sweep(),
        "recent_audit": audit,
    }))
    .into_response()
}

/// Trigger a sweep immediately.
#[utoipa::path(
    post,
    path = "/reaper/sweep",
    tag = "reaper",
    responses(
        (status = 200, description = "Sweep summary"),
        (status = 500, description = "Sweep failed", content_type = "application/problem+json")
    )
)]
pub(crate) async fn sweep(State(state): State<AppState>) -> Response {
    match reaper::sweep(&state).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => responses::engine_error_response(e),
    }
}
