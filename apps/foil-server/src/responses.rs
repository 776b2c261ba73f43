use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::engine::error::EngineError;

/// RFC 7807 problem body with the fields we actually populate.
pub(crate) fn problem_response(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    problem_details_response(status, title, detail, None)
}

pub(crate) fn problem_details_response(
    status: StatusCode,
    title: &str,
    detail: Option<&str>,
    extra: Option<serde_json::Value>,
) -> Response {
    let mut body = json!({
        "type": "about:blank",
        "title": title,
        "status": status.as_u16(),
    });
    if let Some(detail) = detail {
        body["detail"] = json!(detail);
    }
    if let Some(serde_json::Value::Object(map)) = extra {
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in map {
                obj.insert(k, v);
            }
        }
    }
    let mut resp = (status, Json(body)).into_response();
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/problem+json"),
    );
    resp
}

pub(crate) fn internal_error(detail: Option<&str>) -> Response {
    problem_response(StatusCode::INTERNAL_SERVER_ERROR, "Error", detail)
}

/// Map an engine failure onto a problem+json response. Callers that treat a
/// variant as success (idempotent re-execution, say) match on it first.
pub(crate) fn engine_error_response(err: EngineError) -> Response {
    match err {
        EngineError::NotFound(what) => {
            problem_response(StatusCode::NOT_FOUND, "Not Found", Some(&what))
        }
        EngineError::Conflict {
            ref active_run_id, ..
        } => {
            let extra = json!({"active_run_id": active_run_id});
            problem_details_response(
                StatusCode::CONFLICT,
                "Active Run Exists",
                Some(&err.to_string()),
                Some(extra),
            )
        }
        EngineError::StaleState { .. } => {
            problem_response(StatusCode::CONFLICT, "Stale State", Some(&err.to_string()))
        }
        EngineError::AlreadyExecuted {
            ref executed_at,
            ref job_id,
        } => {
            let extra = json!({"executed_at": executed_at, "job_id": job_id});
            problem_details_response(
                StatusCode::CONFLICT,
                "Already Executed",
                Some("side effect was already performed"),
                Some(extra),
            )
        }
        EngineError::PolicyBlocked { ref violations } => {
            let extra = json!({"violations": violations});
            problem_details_response(
                StatusCode::FORBIDDEN,
                "Policy Blocked",
                Some(&err.to_string()),
                Some(extra),
            )
        }
        EngineError::LockContention => problem_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Busy",
            Some("case is being updated; retry shortly"),
        ),
        EngineError::Submission(detail) => {
            problem_response(StatusCode::BAD_GATEWAY, "Submission Failed", Some(&detail))
        }
        EngineError::Invalid(detail) => {
            problem_response(StatusCode::BAD_REQUEST, "Bad Request", Some(&detail))
        }
        EngineError::Internal(e) => internal_error(Some(&e.to_string())),
    }
}
