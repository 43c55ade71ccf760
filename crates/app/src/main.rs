mod ingress;
mod oauth;
mod pending;
mod problem;
mod proxy;
mod router;
mod subscriptions;
mod tap;
mod telemetry;
mod transport;
mod webhooks;

use std::net::SocketAddr;

use tracing::info;
use xaa_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let tap_hub = tap::TapHub::new();
    if config.environment.is_development() {
        tap_hub.spawn_heartbeat();
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("xaa-app/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let (state, sweeper) = router::AppState::new(&config, metrics, tap_hub, http)?;
    sweeper.spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        settings = ?config.x,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
