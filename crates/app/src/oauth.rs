use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use url::Url;
use xaa_upstream::{AuthorizeUrlParams, OAuthError, TokenResponse, XOAuthClient};

use crate::pending::PendingAuth;
use crate::problem::{json_body, ProblemResponse};
use crate::proxy;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind};

pub const OAUTH_SCOPES: &[&str] = &[
    "tweet.read",
    "users.read",
    "offline.access",
    "dm.read",
    "dm.write",
];
const CODE_VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 16;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Begins a PKCE login and returns the provider authorization URL.
pub async fn start(State(state): State<AppState>) -> Result<Json<Value>, ProblemResponse> {
    let (client, redirect_uri) = flow_client(&state)?;

    let state_value = generate_state();
    let code_verifier = generate_code_verifier();
    let code_challenge = compute_code_challenge(&code_verifier);

    let auth_url = client.authorize_url(&AuthorizeUrlParams {
        state: &state_value,
        redirect_uri: &redirect_uri,
        code_challenge: &code_challenge,
        scopes: OAUTH_SCOPES,
    });

    let now = state.now();
    state
        .pending()
        .insert(
            state_value,
            PendingAuth {
                code_verifier,
                created_at: now,
            },
        )
        .await;

    counter!("oauth_flow_total", "step" => "start", "result" => "ok").increment(1);
    info!(stage = "oauth", "oauth login started");
    publish_oauth_event(&state, now, "oauth.login.start", json!({}));

    Ok(Json(json!({ "auth_url": auth_url.as_str() })))
}

/// Completes the login: validates `state`, exchanges the code, and hands the
/// resulting credential to the frontend.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ProblemResponse> {
    let Some(state_param) = query.state.as_deref().filter(|value| !value.is_empty()) else {
        counter!("oauth_flow_total", "step" => "callback", "result" => "missing_state").increment(1);
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "missing_state",
            "state parameter is required",
        ));
    };

    // The record is consumed before any other check so a state value can never be replayed.
    let Some(pending) = state.pending().take(state_param).await else {
        counter!("oauth_flow_total", "step" => "callback", "result" => "invalid_state").increment(1);
        warn!(stage = "oauth", "callback with unknown state");
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            "state parameter does not match a pending login",
        ));
    };

    let now = state.now();
    if pending.is_expired(now, state.pending().ttl()) {
        counter!("oauth_flow_total", "step" => "callback", "result" => "state_expired").increment(1);
        warn!(stage = "oauth", created_at = %pending.created_at, "callback with expired state");
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "state_expired",
            "login attempt has expired, start again",
        ));
    }

    let frontend = state.settings().frontend_url.clone();

    if let Some(error_code) = query.error.as_deref() {
        counter!("oauth_flow_total", "step" => "callback", "result" => "provider_error").increment(1);
        warn!(
            stage = "oauth",
            error = error_code,
            description = query.error_description.as_deref(),
            "provider returned an authorization error"
        );
        publish_oauth_event(
            &state,
            now,
            "oauth.callback.error",
            json!({ "error": error_code }),
        );
        return Ok(error_redirect(
            &frontend,
            error_code,
            query.error_description.as_deref(),
        ));
    }

    let Some(code) = query.code.as_deref().filter(|code| !code.is_empty()) else {
        counter!("oauth_flow_total", "step" => "callback", "result" => "missing_code").increment(1);
        warn!(stage = "oauth", "callback missing code");
        return Ok(error_redirect(&frontend, "missing_code", None));
    };

    let (client, redirect_uri) = flow_client(&state)?;
    let token = match client
        .exchange_code(code, &pending.code_verifier, &redirect_uri)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            counter!("oauth_flow_total", "step" => "callback", "result" => "exchange_failed")
                .increment(1);
            warn!(stage = "oauth", error = %err, "failed to exchange authorization code");
            publish_oauth_event(
                &state,
                now,
                "oauth.callback.exchange_failed",
                json!({ "reason": format_error_code(&err) }),
            );
            return Ok(error_redirect(&frontend, "exchange_failed", None));
        }
    };

    counter!("oauth_flow_total", "step" => "callback", "result" => "ok").increment(1);
    info!(stage = "oauth", expires_in = token.expires_in, "oauth login completed");
    publish_oauth_event(
        &state,
        now,
        "oauth.callback.success",
        json!({ "scope": token.scope, "expires_at": token.expires_at(now) }),
    );

    Ok(redirect_found(success_location(&frontend, &token).as_str()))
}

/// Trades a refresh token for a new credential.
pub async fn refresh(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TokenResponse>, ProblemResponse> {
    let body: RefreshRequest = json_body(&body)?;
    let Some(refresh_token) = body.refresh_token.as_deref().filter(|value| !value.is_empty())
    else {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "missing_refresh_token",
            "refresh_token is required",
        ));
    };

    let (client, _) = flow_client(&state)?;
    let now = state.now();
    match client.refresh_token(refresh_token).await {
        Ok(token) => {
            counter!("oauth_flow_total", "step" => "refresh", "result" => "ok").increment(1);
            publish_oauth_event(
                &state,
                now,
                "oauth.refresh.success",
                json!({ "expires_at": token.expires_at(now) }),
            );
            Ok(Json(token))
        }
        Err(OAuthError::Status { status, body }) => {
            counter!("oauth_flow_total", "step" => "refresh", "result" => "rejected").increment(1);
            warn!(stage = "oauth", %status, "refresh rejected by provider");
            publish_oauth_event(
                &state,
                now,
                "oauth.refresh.rejected",
                json!({ "status": status.as_u16() }),
            );
            Err(
                ProblemResponse::new(status, "refresh_failed", "provider rejected the refresh token")
                    .with_details(proxy::parse_body(body)),
            )
        }
        Err(err) => {
            counter!("oauth_flow_total", "step" => "refresh", "result" => "failed").increment(1);
            error!(stage = "oauth", error = %err, "refresh request failed");
            Err(ProblemResponse::internal("failed to refresh OAuth token"))
        }
    }
}

/// Returns the profile of the user owning the caller's bearer token.
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProblemResponse> {
    let token = proxy::caller_token(&headers)?;
    match state.api().me(&token).await {
        Ok(reply) => Ok(proxy::forward(&state, "users.me", reply)),
        Err(err) => Err(proxy::failure(&state, "users.me", err)),
    }
}

fn flow_client(state: &AppState) -> Result<(XOAuthClient, String), ProblemResponse> {
    let client = state.oauth_client().cloned();
    let redirect_uri = state.settings().redirect_uri.clone();
    match (client, redirect_uri) {
        (Some(client), Some(redirect_uri)) => Ok((client, redirect_uri)),
        _ => {
            error!(stage = "oauth", "X_CLIENT_ID or X_REDIRECT_URI is not configured");
            Err(ProblemResponse::misconfigured(
                "OAuth client id or redirect URI is not configured",
            ))
        }
    }
}

fn success_location(frontend: &Url, token: &TokenResponse) -> Url {
    let mut location = frontend.clone();
    {
        let mut query = location.query_pairs_mut();
        query.append_pair("access_token", &token.access_token);
        if let Some(refresh_token) = &token.refresh_token {
            query.append_pair("refresh_token", refresh_token);
        }
        if let Some(expires_in) = token.expires_in {
            query.append_pair("expires_in", &expires_in.to_string());
        }
    }
    location
}

fn error_redirect(frontend: &Url, reason: &str, detail: Option<&str>) -> Response {
    let mut location = frontend.clone();
    {
        let mut query = location.query_pairs_mut();
        query.append_pair("error", reason);
        if let Some(detail) = detail {
            query.append_pair("error_description", detail);
        }
    }
    redirect_found(location.as_str())
}

fn redirect_found(location: &str) -> Response {
    let mut response = Redirect::temporary(location).into_response();
    *response.status_mut() = StatusCode::FOUND;
    response
}

fn generate_code_verifier() -> String {
    let mut bytes = [0u8; CODE_VERIFIER_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn compute_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn format_error_code(err: &OAuthError) -> String {
    match err {
        OAuthError::Status { status, .. } => status.as_u16().to_string(),
        other => other.to_string(),
    }
}

fn publish_oauth_event(state: &AppState, timestamp: DateTime<Utc>, message: &str, payload: Value) {
    state.tap().publish(StageEvent::labelled(
        timestamp,
        StageKind::Oauth,
        message,
        payload,
    ));
}
