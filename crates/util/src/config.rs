use std::{env, fmt, net::SocketAddr, time::Duration};

use chrono_tz::Tz;
use url::Url;

use super::{server_bind_address, BindAddressError};

const DEFAULT_FRONTEND_URL: &str = "http://localhost:8080/";
const DEFAULT_API_BASE_URL: &str = "https://api.twitter.com/2/";
const DEFAULT_AUTHORIZE_URL: &str = "https://twitter.com/i/oauth2/authorize";
const DEFAULT_OAUTH_STATE_TTL_SECS: u64 = 3600;
const DEFAULT_OAUTH_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_EVENTS_MAX_RETAINED: usize = 50;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and endpoints for the upstream provider.
///
/// Secrets stay optional at startup: handlers that need a missing value answer
/// with a "server misconfigured" problem instead of refusing to boot.
#[derive(Clone)]
pub struct XSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub bearer_token: Option<String>,
    pub api_key_secret: Option<String>,
    pub frontend_url: Url,
    pub api_base_url: Url,
    pub authorize_url: Url,
}

impl fmt::Debug for XSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("redirect_uri", &self.redirect_uri)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("api_key_secret", &self.api_key_secret.as_ref().map(|_| "***"))
            .field("frontend_url", &self.frontend_url.as_str())
            .field("api_base_url", &self.api_base_url.as_str())
            .field("authorize_url", &self.authorize_url.as_str())
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub x: XSettings,
    pub oauth_state_ttl: Duration,
    pub oauth_sweep_interval: Duration,
    pub events_max_retained: usize,
    /// Zone used to interpret replay wall-clock inputs; `None` means host local time.
    pub replay_timezone: Option<Tz>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let x = XSettings {
            client_id: optional_var("X_CLIENT_ID"),
            client_secret: optional_var("X_CLIENT_SECRET"),
            redirect_uri: optional_var("X_REDIRECT_URI"),
            bearer_token: optional_var("X_BEARER_TOKEN"),
            api_key_secret: optional_var("X_API_KEY_SECRET"),
            frontend_url: url_var("FRONTEND_URL", DEFAULT_FRONTEND_URL, false)?,
            api_base_url: url_var("X_API_BASE_URL", DEFAULT_API_BASE_URL, true)?,
            authorize_url: url_var("X_AUTHORIZE_URL", DEFAULT_AUTHORIZE_URL, false)?,
        };

        let oauth_state_ttl = Duration::from_secs(number_var(
            "OAUTH_STATE_TTL_SECS",
            DEFAULT_OAUTH_STATE_TTL_SECS,
        )?);
        let oauth_sweep_interval = Duration::from_secs(number_var(
            "OAUTH_SWEEP_INTERVAL_SECS",
            DEFAULT_OAUTH_SWEEP_INTERVAL_SECS,
        )?);
        let events_max_retained = number_var::<usize>(
            "EVENTS_MAX_RETAINED",
            DEFAULT_EVENTS_MAX_RETAINED,
        )?;
        if events_max_retained == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "EVENTS_MAX_RETAINED",
                value: "0".to_string(),
            });
        }

        let replay_timezone = match optional_var("REPLAY_TIMEZONE") {
            Some(name) => Some(
                name.parse::<Tz>()
                    .map_err(|_| ConfigError::InvalidTimezone(name.clone()))?,
            ),
            None => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            x,
            oauth_state_ttl,
            oauth_sweep_interval,
            events_max_retained,
            replay_timezone,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn url_var(name: &'static str, default: &str, as_base: bool) -> Result<Url, ConfigError> {
    let mut raw = optional_var(name).unwrap_or_else(|| default.to_string());
    // `Url::join` drops the last path segment unless the base ends with a slash.
    if as_base && !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { var: name, source })
}

fn number_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { var: name, value }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(BindAddressError),
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    InvalidNumber {
        var: &'static str,
        value: String,
    },
    InvalidTimezone(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "{err}"),
            Self::InvalidUrl { var, source } => write!(f, "invalid {var} value: {source}"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
            Self::InvalidTimezone(value) => {
                write!(f, "REPLAY_TIMEZONE must be an IANA zone name (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
