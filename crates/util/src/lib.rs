pub mod config;

use std::{env, net::SocketAddr};

pub use config::{AppConfig, ConfigError, Environment, XSettings};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Returns the address the HTTP server should bind to.
///
/// The value is resolved from the `APP_BIND_ADDR` environment variable and
/// falls back to [`DEFAULT_BIND_ADDR`] when the variable is not set. A `PORT`
/// variable, as set by most hosting platforms, replaces the port component.
pub fn server_bind_address() -> Result<SocketAddr, BindAddressError> {
    let value = env::var("APP_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let mut addr: SocketAddr = value.parse().map_err(BindAddressError::Address)?;

    if let Some(port) = env::var("PORT").ok().filter(|raw| !raw.trim().is_empty()) {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| BindAddressError::Port(port.clone()))?;
        addr.set_port(port);
    }

    Ok(addr)
}

/// Errors produced while resolving the listen address.
#[derive(Debug)]
pub enum BindAddressError {
    Address(std::net::AddrParseError),
    Port(String),
}

impl std::fmt::Display for BindAddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Address(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Port(value) => write!(f, "invalid PORT value: {value}"),
        }
    }
}

impl std::error::Error for BindAddressError {}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{LazyLock, Mutex};

    /// Serializes tests that mutate process environment variables.
    pub static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
}
