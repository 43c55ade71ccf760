use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::info;
use xaa_upstream::{OAuthError, XApiClient, XOAuthClient};
use xaa_util::{AppConfig, XSettings};

use crate::pending::{AuthSweeper, PendingAuthStore};
use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::transport::EventHub;
use crate::{ingress, oauth, subscriptions, telemetry, transport, webhooks};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    settings: Arc<XSettings>,
    replay_timezone: Option<Tz>,
    api: XApiClient,
    oauth: Option<XOAuthClient>,
    pending: PendingAuthStore,
    events: EventHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    /// Builds the shared state and the sweeper that keeps its pending-login table bounded.
    ///
    /// The OAuth client only exists when `X_CLIENT_ID` is configured; login
    /// handlers answer with a misconfiguration problem otherwise.
    pub fn new(
        config: &AppConfig,
        metrics: PrometheusHandle,
        tap: TapHub,
        http: reqwest::Client,
    ) -> Result<(Self, AuthSweeper), OAuthError> {
        let settings = config.x.clone();
        let api = XApiClient::new(settings.api_base_url.clone(), http.clone());
        let oauth = match settings.client_id.as_deref() {
            Some(client_id) => Some(XOAuthClient::new(
                client_id,
                settings.client_secret.clone(),
                settings.authorize_url.clone(),
                &settings.api_base_url,
                http,
            )?),
            None => None,
        };

        let pending = PendingAuthStore::new(config.oauth_state_ttl);
        let sweeper = AuthSweeper::new(pending.clone(), tap.clone(), config.oauth_sweep_interval);

        let state = Self {
            metrics,
            tap,
            settings: Arc::new(settings),
            replay_timezone: config.replay_timezone,
            api,
            oauth,
            pending,
            events: EventHub::new(config.events_max_retained),
            clock: Arc::new(Utc::now),
        };
        Ok((state, sweeper))
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn settings(&self) -> &XSettings {
        &self.settings
    }

    pub fn replay_timezone(&self) -> Option<Tz> {
        self.replay_timezone
    }

    pub fn api(&self) -> &XApiClient {
        &self.api
    }

    pub fn oauth_client(&self) -> Option<&XOAuthClient> {
        self.oauth.as_ref()
    }

    pub fn pending(&self) -> &PendingAuthStore {
        &self.pending
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/tap", get(debug_tap))
        .route("/api/webhooks", get(webhooks::list).post(webhooks::create))
        .route(
            "/api/webhooks/provider",
            get(ingress::crc).post(ingress::receive),
        )
        .route(
            "/api/webhooks/subscriptions/count",
            get(subscriptions::count),
        )
        .route(
            "/api/webhooks/:id",
            put(webhooks::validate).delete(webhooks::delete),
        )
        .route("/api/webhooks/:id/replay", post(webhooks::replay))
        .route(
            "/api/webhooks/:id/subscriptions",
            get(subscriptions::check).post(subscriptions::subscribe),
        )
        .route(
            "/api/webhooks/:id/subscriptions/list",
            get(subscriptions::list),
        )
        .route(
            "/api/webhooks/:id/subscriptions/:user_id",
            delete(subscriptions::unsubscribe),
        )
        .route("/api/auth/start", get(oauth::start))
        .route("/api/auth/callback", get(oauth::callback))
        .route("/api/auth/refresh", post(oauth::refresh))
        .route("/api/auth/users/me", get(oauth::me))
        .route("/events/poll", get(transport::poll))
        .route("/events/ws", get(transport::ws_upgrade))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    info!(stage = "app", "tap stream opened");
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration as StdDuration;

    use url::Url;
    use xaa_util::{AppConfig, Environment, XSettings};

    use super::AppState;
    use crate::tap::TapHub;
    use crate::telemetry;

    pub fn test_config(api_base: &str) -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            environment: Environment::Test,
            x: XSettings {
                client_id: Some("client-id".into()),
                client_secret: None,
                redirect_uri: Some("http://localhost:3000/api/auth/callback".into()),
                bearer_token: Some("app-token".into()),
                api_key_secret: Some("s3cr3t".into()),
                frontend_url: Url::parse("http://localhost:8080/").expect("frontend"),
                api_base_url: Url::parse(&format!("{api_base}/2/")).expect("api base"),
                authorize_url: Url::parse("https://twitter.com/i/oauth2/authorize")
                    .expect("authorize"),
            },
            oauth_state_ttl: StdDuration::from_secs(600),
            oauth_sweep_interval: StdDuration::from_secs(60),
            events_max_retained: 50,
            replay_timezone: Some(chrono_tz::Asia::Tokyo),
        }
    }

    pub fn setup_state(api_base: &str) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let (state, _sweeper) = AppState::new(
            &test_config(api_base),
            metrics,
            TapHub::new(),
            reqwest::Client::new(),
        )
        .expect("state");
        state
    }
}
