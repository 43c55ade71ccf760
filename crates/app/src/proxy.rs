//! Shared plumbing for handlers that forward calls to the provider API.
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use xaa_upstream::{ApiReply, XApiError};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind};

/// Application bearer token used for admin and read-only calls.
pub fn app_token(state: &AppState) -> Result<String, ProblemResponse> {
    state.settings().bearer_token.clone().ok_or_else(|| {
        error!(stage = "proxy", "X_BEARER_TOKEN is not configured");
        ProblemResponse::misconfigured("application bearer token is not configured")
    })
}

/// Extracts the caller's own access token from `Authorization: Bearer ...`.
pub fn caller_token(headers: &HeaderMap) -> Result<String, ProblemResponse> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "missing_bearer",
                "missing or invalid Authorization header",
            )
        })
}

/// Relays a successful upstream answer with its status and JSON body.
pub fn forward(state: &AppState, op: &'static str, reply: ApiReply) -> Response {
    record(state, op, "ok", reply.status);
    json_or_empty(reply.status, reply.body)
}

/// Replies with `status` and no body, whatever the upstream success code was.
pub fn acknowledge(state: &AppState, op: &'static str, reply: ApiReply, status: StatusCode) -> Response {
    record(state, op, "ok", reply.status);
    status.into_response()
}

/// Maps an upstream failure to the local problem envelope.
///
/// Non-2xx answers keep their status and carry the upstream body in
/// `details`; transport and decoding failures become a generic 500.
pub fn failure(state: &AppState, op: &'static str, err: XApiError) -> ProblemResponse {
    match err {
        XApiError::Status { status, body } => {
            record(state, op, "upstream_error", status);
            warn!(stage = "proxy", op, %status, "upstream rejected request");
            ProblemResponse::new(status, "upstream_error", format!("{op} failed upstream"))
                .with_details(parse_body(body))
        }
        other => {
            record(state, op, "failed", StatusCode::INTERNAL_SERVER_ERROR);
            error!(stage = "proxy", op, error = %other, "upstream call failed");
            ProblemResponse::internal(format!("{op} could not reach the upstream API"))
        }
    }
}

/// Like [`failure`], but forwards an upstream error body unchanged.
pub fn failure_verbatim(state: &AppState, op: &'static str, err: XApiError) -> Response {
    match err {
        XApiError::Status { status, body } => {
            record(state, op, "upstream_error", status);
            warn!(stage = "proxy", op, %status, "upstream rejected request");
            json_or_empty(status, parse_body(body))
        }
        other => failure(state, op, other).into_response(),
    }
}

pub fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

fn json_or_empty(status: StatusCode, body: Value) -> Response {
    if body.is_null() {
        status.into_response()
    } else {
        (status, Json(body)).into_response()
    }
}

fn record(state: &AppState, op: &'static str, result: &'static str, status: StatusCode) {
    counter!("proxy_requests_total", "op" => op, "result" => result).increment(1);
    info!(stage = "proxy", op, result, status = status.as_u16(), "proxy call finished");
    state.tap().publish(StageEvent::labelled(
        state.now(),
        StageKind::Proxy,
        op,
        json!({ "result": result, "status": status.as_u16() }),
    ));
}
