use axum::routing::{get, post};
use axum::Router;
use utoipa::OpenApi;

use crate::api;
use crate::app_state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "foil-server", description = "FOIA case orchestration engine"),
    paths(
        api::meta::healthz,
        api::cases::create_case,
        api::cases::list_cases,
        api::cases::get_case,
        api::cases::case_activity,
        api::cases::withdraw_case,
        api::cases::portal_cancel,
        api::cases::set_autopilot,
        api::runs::start_run,
        api::runs::list_runs,
        api::runs::get_run,
        api::runs::cancel_run,
        api::runs::retry_run,
        api::runs::replay_run,
        api::runs::replay_diff,
        api::proposals::list_proposals,
        api::proposals::get_proposal,
        api::proposals::decide,
        api::proposals::execute,
        api::dlq::list_dlq,
        api::dlq::retry_dlq,
        api::dlq::discard_dlq,
        api::reaper::status,
        api::reaper::sweep,
        api::events::recent,
    )
)]
struct ApiDoc;

async fn openapi_spec() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(ApiDoc::openapi())
}

pub(crate) fn build(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::meta::healthz))
        .route("/spec/openapi.json", get(openapi_spec))
        .route(
            "/cases",
            post(api::cases::create_case).get(api::cases::list_cases),
        )
        .route("/cases/{id}", get(api::cases::get_case))
        .route("/cases/{id}/activity", get(api::cases::case_activity))
        .route("/cases/{id}/withdraw", post(api::cases::withdraw_case))
        .route("/cases/{id}/portal_cancel", post(api::cases::portal_cancel))
        .route("/cases/{id}/autopilot", post(api::cases::set_autopilot))
        .route("/cases/{id}/runs", post(api::runs::start_run))
        .route("/runs", get(api::runs::list_runs))
        .route("/runs/{id}", get(api::runs::get_run))
        .route("/runs/{id}/cancel", post(api::runs::cancel_run))
        .route("/runs/{id}/retry", post(api::runs::retry_run))
        .route(
            "/runs/{id}/replay",
            post(api::runs::replay_run).get(api::runs::replay_diff),
        )
        .route("/proposals", get(api::proposals::list_proposals))
        .route("/proposals/{id}", get(api::proposals::get_proposal))
        .route("/proposals/{id}/decision", post(api::proposals::decide))
        .route("/proposals/{id}/execute", post(api::proposals::execute))
        .route("/dlq", get(api::dlq::list_dlq))
        .route("/dlq/{id}/retry", post(api::dlq::retry_dlq))
        .route("/dlq/{id}/discard", post(api::dlq::discard_dlq))
        .route("/reaper", get(api::reaper::status))
        .route("/reaper/sweep", post(api::reaper::sweep))
        .route("/events", get(api::events::recent))
        .with_state(state)
}
