use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::app_state::AppState;

/// Liveness probe with a few queue counters.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "meta",
    responses((status = 200, description = "Service health"))
)]
pub(crate) async fn healthz(State(state): State<AppState>) -> Response {
    let kernel = state.kernel();
    let queued = kernel
        .count_jobs_by_state_async("queued".to_string())
        .await
        .unwrap_or(-1);
    let running = kernel
        .count_jobs_by_state_async("running".to_string())
        .await
        .unwrap_or(-1);
    let dead = kernel
        .count_jobs_by_state_async("dead".to_string())
        .await
        .unwrap_or(-1);
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": {"queued": queued, "running": running, "dead": dead},
    }))
    .into_response()
}
