use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use xaa_util::{AppConfig, Environment};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Used when `RUST_LOG` is unset or unparsable.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,h2=warn,reqwest=warn";

static TRACING_READY: OnceLock<LogFormat> = OnceLock::new();
static METRICS: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// Shape of the log lines written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT` wins when it names a known format; otherwise production
    /// logs JSON and everything else logs pretty.
    pub fn select(environment: Environment, requested: Option<&str>) -> Self {
        match requested.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => Self::Json,
            Some("compact") => Self::Compact,
            Some("pretty") => Self::Pretty,
            _ if environment == Environment::Production => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let format = LogFormat::select(
        config.environment,
        std::env::var("LOG_FORMAT").ok().as_deref(),
    );
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let output = match format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().flatten_event(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(default_filter())
        .with(output)
        .try_init()?;
    TRACING_READY.set(format).ok();

    tracing::info!(
        stage = "telemetry",
        env = config.environment.as_str(),
        log_format = ?format,
        version = BUILD_VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the global Prometheus recorder once and hands out its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *slot = Some(handle.clone());
    drop(slot);

    describe_metrics();
    STARTED_AT.get_or_init(Instant::now);
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");

    describe_counter!(
        "activity_ingress_total",
        "Activity deliveries accepted, labelled by classified kind"
    );
    describe_counter!(
        "activity_invalid_signature_total",
        "Activity deliveries rejected for a bad or missing signature"
    );
    describe_histogram!(
        "webhook_ack_latency_seconds",
        "Seconds spent acknowledging deliveries and CRC checks"
    );

    describe_counter!(
        "events_published_total",
        "Delivered events fanned out to live transports"
    );
    describe_counter!(
        "transport_poll_requests_total",
        "Short-poll requests, labelled by result"
    );
    describe_gauge!(
        "transport_pollers",
        "Short-poll clients currently remembered"
    );
    describe_gauge!(
        "transport_ws_connections",
        "Authenticated push connections currently open"
    );

    describe_counter!(
        "proxy_requests_total",
        "Upstream proxy calls, labelled by operation and result"
    );
    describe_counter!(
        "oauth_flow_total",
        "OAuth flow steps, labelled by step and result"
    );
    describe_gauge!(
        "oauth_pending_states",
        "OAuth login attempts awaiting their callback"
    );
    describe_counter!(
        "oauth_pending_swept_total",
        "Expired OAuth login attempts removed by the sweeper"
    );
}

/// Renders the recorder output followed by the build and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    // Writing into a String cannot fail.
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1",
        git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_follows_environment_unless_overridden() {
        assert_eq!(
            LogFormat::select(Environment::Production, None),
            LogFormat::Json
        );
        assert_eq!(
            LogFormat::select(Environment::Development, None),
            LogFormat::Pretty
        );
        assert_eq!(
            LogFormat::select(Environment::Production, Some(" Compact ")),
            LogFormat::Compact
        );
        assert_eq!(
            LogFormat::select(Environment::Test, Some("json")),
            LogFormat::Json
        );
        assert_eq!(
            LogFormat::select(Environment::Production, Some("yaml")),
            LogFormat::Json
        );
    }

    #[test]
    fn render_appends_build_and_uptime_gauges() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let body = render_metrics(&handle);
        assert!(body.contains("# TYPE app_build_info gauge\n"));
        assert!(body.contains(&format!("app_build_info{{version=\"{BUILD_VERSION}\"")));
        assert!(body.contains("# TYPE app_uptime_seconds gauge\napp_uptime_seconds "));
        assert!(body.ends_with('\n'));
    }
}
