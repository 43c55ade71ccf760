use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use xaa_core::classify;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

pub const HEADER_SIGNATURE: &str = "x-twitter-webhooks-signature";

#[derive(Debug, Deserialize)]
pub struct CrcQuery {
    #[serde(default)]
    crc_token: Option<String>,
}

/// Answers the provider's challenge-response check for the webhook URL.
pub async fn crc(
    State(state): State<AppState>,
    Query(query): Query<CrcQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let start = Instant::now();
    let Some(token) = query.crc_token.as_deref().filter(|token| !token.is_empty()) else {
        warn!(stage = "ingress", "crc request without crc_token");
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "missing_crc_token",
            "crc_token query parameter is required",
        ));
    };

    let secret = consumer_secret(&state)?;
    let response_token = crc_response_token(secret.as_bytes(), token)?;

    histogram!("webhook_ack_latency_seconds", "type" => "crc").record(start.elapsed().as_secs_f64());
    info!(stage = "ingress", "crc challenge answered");
    state.tap().publish(StageEvent::labelled(
        state.now(),
        StageKind::Ingress,
        "ingress.crc",
        json!({ "status": StatusCode::OK.as_u16() }),
    ));

    Ok(Json(json!({ "response_token": response_token })))
}

/// Accepts an activity delivery, classifies it, and hands it to the event hub.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ProblemResponse> {
    let start = Instant::now();

    if let Some(signature) = headers.get(HEADER_SIGNATURE) {
        let secret = consumer_secret(&state)?;
        let provided = signature.to_str().unwrap_or_default();
        if let Err(reason) = verify_signature(secret.as_bytes(), &body, provided) {
            counter!("activity_invalid_signature_total").increment(1);
            histogram!("webhook_ack_latency_seconds", "type" => "activity")
                .record(start.elapsed().as_secs_f64());
            warn!(stage = "ingress", %reason, "activity delivery rejected");
            return Err(ProblemResponse::new(
                StatusCode::FORBIDDEN,
                "invalid_signature",
                reason,
            ));
        }
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|err| {
        histogram!("webhook_ack_latency_seconds", "type" => "activity")
            .record(start.elapsed().as_secs_f64());
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    let received_at = state.now();
    let event = classify(&payload);
    let kind = event.kind();
    counter!("activity_ingress_total", "kind" => kind).increment(1);
    info!(stage = "classifier", kind, "activity classified");

    state.tap().publish(StageEvent {
        ts: received_at,
        stage: StageKind::Ingress,
        meta: StageMetadata {
            size_bytes: Some(body.len() as u64),
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            ..StageMetadata::default()
        },
        r#in: StagePayload::redacted(Value::Null),
        out: StagePayload::redacted(json!({ "status": StatusCode::OK.as_u16() })),
    });
    state.tap().publish(StageEvent {
        ts: received_at,
        stage: StageKind::Classifier,
        meta: StageMetadata {
            event_kind: Some(kind.to_string()),
            ..StageMetadata::default()
        },
        r#in: StagePayload::default(),
        out: StagePayload::redacted(event.redacted()),
    });

    let delivered = state.events().publish(received_at, payload, event).await;
    histogram!("webhook_ack_latency_seconds", "type" => "activity")
        .record(start.elapsed().as_secs_f64());

    Ok(Json(json!({
        "received": true,
        "kind": delivered.kind,
        "seq": delivered.seq,
    })))
}

fn consumer_secret(state: &AppState) -> Result<String, ProblemResponse> {
    state.settings().api_key_secret.clone().ok_or_else(|| {
        error!(stage = "ingress", "X_API_KEY_SECRET is not configured");
        ProblemResponse::misconfigured("consumer secret is not configured")
    })
}

fn mac_for(secret: &[u8]) -> Result<Hmac<Sha256>, ProblemResponse> {
    Hmac::<Sha256>::new_from_slice(secret).map_err(|err| {
        error!(stage = "ingress", error = %err, "failed to initialize hmac");
        ProblemResponse::internal("failed to initialize signature")
    })
}

/// `sha256=` followed by the base64 HMAC-SHA256 of `token` under the consumer secret.
pub fn crc_response_token(secret: &[u8], token: &str) -> Result<String, ProblemResponse> {
    let mut mac = mac_for(secret)?;
    mac.update(token.as_bytes());
    Ok(format!("sha256={}", STANDARD.encode(mac.finalize().into_bytes())))
}

fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> Result<(), String> {
    let encoded = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes = STANDARD
        .decode(encoded)
        .map_err(|_| "signature is not valid base64".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}
