use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::{info, warn};
use xaa_upstream::{ApiReply, XApiError};

use crate::problem::ProblemResponse;
use crate::proxy;
use crate::router::AppState;

pub async fn count(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    match state.api().subscription_count(&token).await {
        Ok(reply) => Ok(proxy::forward(&state, "subscriptions.count", reply)),
        Err(err) => Err(proxy::failure(&state, "subscriptions.count", err)),
    }
}

pub async fn check(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    match state.api().check_subscription(&token, &webhook_id).await {
        Ok(reply) => Ok(proxy::forward(&state, "subscriptions.check", reply)),
        Err(err) => Err(proxy::failure(&state, "subscriptions.check", err)),
    }
}

/// Lists subscribed accounts and hydrates each with its profile.
///
/// Profiles are fetched concurrently; a failed lookup yields an
/// `{id, error}` entry instead of failing the whole listing.
pub async fn list(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let token = proxy::app_token(&state)?;
    let reply = state
        .api()
        .list_subscriptions(&token, &webhook_id)
        .await
        .map_err(|err| proxy::failure(&state, "subscriptions.list", err))?;

    let ids = subscribed_ids(&reply.body);
    let lookups = ids.iter().map(|id| {
        let api = state.api().clone();
        let token = token.clone();
        async move { api.user_profile(&token, id).await }
    });
    let results = join_all(lookups).await;

    let mut failed = 0usize;
    let subscriptions: Vec<Value> = ids
        .iter()
        .zip(results)
        .map(|(id, result)| match result {
            Ok(profile) => json!(profile),
            Err(err) => {
                failed += 1;
                warn!(stage = "proxy", user_id = %id, error = %err, "profile lookup failed");
                json!({ "id": id, "error": lookup_error(&err) })
            }
        })
        .collect();

    info!(
        stage = "proxy",
        webhook_id = %webhook_id,
        total = subscriptions.len(),
        failed,
        "subscription list hydrated"
    );
    Ok(proxy::forward(
        &state,
        "subscriptions.list",
        ApiReply {
            status: reply.status,
            body: json!({ "data": { "subscriptions": subscriptions } }),
        },
    ))
}

/// Subscribes the calling user, identified by their own bearer token.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProblemResponse> {
    let token = proxy::caller_token(&headers)?;
    match state.api().subscribe(&token, &webhook_id).await {
        Ok(reply) => Ok(proxy::forward(&state, "subscriptions.subscribe", reply)),
        Err(err) => Err(proxy::failure(&state, "subscriptions.subscribe", err)),
    }
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Path((webhook_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProblemResponse> {
    let token = proxy::caller_token(&headers)?;
    match state.api().unsubscribe(&token, &webhook_id, &user_id).await {
        Ok(reply) => Ok(proxy::forward(&state, "subscriptions.unsubscribe", reply)),
        Err(err) => Err(proxy::failure(&state, "subscriptions.unsubscribe", err)),
    }
}

/// Collects subscribed user ids, dropping duplicates but keeping first-seen order.
///
/// Accepts both `data.subscriptions: [{user_id}]` and a bare `data: [{user_id}]`.
fn subscribed_ids(body: &Value) -> Vec<String> {
    let entries = body
        .pointer("/data/subscriptions")
        .or_else(|| body.get("data"))
        .and_then(Value::as_array);
    let Some(entries) = entries else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("user_id").or_else(|| entry.get("id"))?;
            match id {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            }
        })
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn lookup_error(err: &XApiError) -> String {
    match err {
        XApiError::Status { status, .. } => format!("lookup failed with status {}", status.as_u16()),
        XApiError::Lookup(detail) => detail.clone(),
        _ => "lookup failed".to_string(),
    }
}
