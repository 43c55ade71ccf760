use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};
use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::problem::{json_body, ProblemResponse};
use crate::proxy;
use crate::router::AppState;

const REPLAY_INPUT_LEN: usize = 12;
const REPLAY_OUTPUT_FORMAT: &str = "%Y%m%d%H%M";

pub async fn list(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    match state.api().list_webhooks(&token).await {
        Ok(reply) => Ok(proxy::forward(&state, "webhooks.list", reply)),
        Err(err) => Err(proxy::failure(&state, "webhooks.list", err)),
    }
}

/// Registers a callback URL. Upstream status and body are relayed unchanged.
pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let body: Value = json_body(&body)?;
    let token = proxy::app_token(&state)?;
    let url = body
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                "'url' is required and must be a non-empty string",
            )
        })?;

    Ok(match state.api().create_webhook(&token, url).await {
        Ok(reply) => proxy::forward(&state, "webhooks.create", reply),
        Err(err) => proxy::failure_verbatim(&state, "webhooks.create", err),
    })
}

/// Triggers a fresh CRC check of the webhook by the provider.
pub async fn validate(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    match state.api().validate_webhook(&token, &webhook_id).await {
        Ok(reply) => Ok(proxy::acknowledge(
            &state,
            "webhooks.validate",
            reply,
            StatusCode::NO_CONTENT,
        )),
        Err(err) => Err(proxy::failure(&state, "webhooks.validate", err)),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    match state.api().delete_webhook(&token, &webhook_id).await {
        Ok(reply) => Ok(proxy::acknowledge(
            &state,
            "webhooks.delete",
            reply,
            StatusCode::NO_CONTENT,
        )),
        Err(err) => Err(proxy::failure(&state, "webhooks.delete", err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    from_date: Option<String>,
    #[serde(default)]
    to_date: Option<String>,
}

/// Requests redelivery of a past window given as local `YYYYMMDDHHmm` times.
pub async fn replay(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Response, ProblemResponse> {
    let zone = state.replay_timezone();
    let window = required("from_date", query.from_date.as_deref())
        .and_then(|from| Ok((from, required("to_date", query.to_date.as_deref())?)))
        .and_then(|(from, to)| {
            Ok((
                local_to_utc("from_date", from, zone)?,
                local_to_utc("to_date", to, zone)?,
            ))
        });
    let (from_utc, to_utc) = window.map_err(|err| {
        warn!(stage = "proxy", error = %err, "replay window rejected");
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_replay_window", err.to_string())
    })?;

    let token = proxy::app_token(&state)?;
    match state
        .api()
        .replay(&token, &webhook_id, &from_utc, &to_utc)
        .await
    {
        Ok(reply) => Ok(proxy::forward(&state, "webhooks.replay", reply)),
        Err(err) => Err(proxy::failure(&state, "webhooks.replay", err)),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayInputError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field} must be exactly 12 digits in YYYYMMDDHHmm form (got {value:?})")]
    Format { field: &'static str, value: String },
    #[error("{field} is not a valid calendar date and time (got {value})")]
    Calendar { field: &'static str, value: String },
    #[error("{field} does not exist in the configured time zone (got {value})")]
    Nonexistent { field: &'static str, value: String },
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, ReplayInputError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(ReplayInputError::Missing(field))
}

/// Converts a local wall-clock `YYYYMMDDHHmm` value to the same format in UTC.
///
/// `zone` of `None` uses the host's local offset. Ambiguous local times
/// (a clock set back) resolve to the earlier instant.
pub fn local_to_utc(
    field: &'static str,
    raw: &str,
    zone: Option<Tz>,
) -> Result<String, ReplayInputError> {
    if raw.len() != REPLAY_INPUT_LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ReplayInputError::Format {
            field,
            value: raw.to_string(),
        });
    }

    let calendar = || ReplayInputError::Calendar {
        field,
        value: raw.to_string(),
    };
    let number = |range: std::ops::Range<usize>| raw[range].parse::<u32>().map_err(|_| calendar());
    let year = raw[0..4].parse::<i32>().map_err(|_| calendar())?;
    let naive = NaiveDate::from_ymd_opt(year, number(4..6)?, number(6..8)?)
        .and_then(|date| date.and_hms_opt(number(8..10).ok()?, number(10..12).ok()?, 0))
        .ok_or_else(calendar)?;

    let resolved = match zone {
        Some(zone) => resolve(&zone, &naive),
        None => resolve(&chrono::Local, &naive),
    };
    resolved
        .map(|utc| utc.format(REPLAY_OUTPUT_FORMAT).to_string())
        .ok_or(ReplayInputError::Nonexistent {
            field,
            value: raw.to_string(),
        })
}

fn resolve<Z: TimeZone>(zone: &Z, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(naive) {
        LocalResult::Single(local) => Some(local.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America::New_York, Asia::Tokyo, UTC};

    #[test]
    fn converts_with_configured_zone() {
        assert_eq!(
            local_to_utc("from_date", "202505151200", Some(Tokyo)).expect("tokyo"),
            "202505150300"
        );
        assert_eq!(
            local_to_utc("from_date", "202501010000", Some(UTC)).expect("utc"),
            "202501010000"
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for raw in ["2025131501", "20251315010a", "2025051512000", "２０２５０５１５１２００"] {
            let err = local_to_utc("from_date", raw, Some(UTC)).expect_err(raw);
            assert!(matches!(err, ReplayInputError::Format { field: "from_date", .. }));
        }
    }

    #[test]
    fn rejects_impossible_calendar_values() {
        for raw in ["202513150100", "202502300100", "202505152400", "202505151260"] {
            let err = local_to_utc("to_date", raw, Some(UTC)).expect_err(raw);
            assert!(matches!(err, ReplayInputError::Calendar { field: "to_date", .. }));
        }
    }

    #[test]
    fn handles_daylight_saving_transitions() {
        // 02:30 does not exist on the spring-forward day in New York.
        let err = local_to_utc("from_date", "202503090230", Some(New_York)).expect_err("gap");
        assert!(matches!(err, ReplayInputError::Nonexistent { .. }));

        // 01:30 happens twice on the fall-back day; the EDT reading comes first.
        assert_eq!(
            local_to_utc("from_date", "202511020130", Some(New_York)).expect("ambiguous"),
            "202511020530"
        );
    }

    #[test]
    fn missing_values_are_reported_by_name() {
        assert_eq!(required("to_date", None), Err(ReplayInputError::Missing("to_date")));
        assert_eq!(required("to_date", Some("")), Err(ReplayInputError::Missing("to_date")));
        assert_eq!(required("to_date", Some("1")), Ok("1"));
    }
}
