use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::responses;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    /// Return only events after this ledger id (for polling).
    #[serde(default)]
    pub after: Option<i64>,
}

/// Read the durable event ledger, oldest first.
#[utoipa::path(
    get,
    path = "/events",
    tag = "events",
    params(
        ("limit" = Option<i64>, Query, description = "Max rows"),
        ("after" = Option<i64>, Query, description = "Ledger id cursor")
    ),
    responses((status = 200, description = "Events"))
)]
pub(crate) async fn recent(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Response {
    match state
        .kernel()
        .recent_events_async(q.limit.unwrap_or(100).clamp(1, 1000), q.after)
        .await
    {
        Ok(items) => Json(json!({"items": items})).into_response(),
        Err(e) => responses::internal_error(Some(&e.to_string())),
    }
}
