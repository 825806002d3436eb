//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Clone)]
pub struct RedactedString(String);

impl RedactedString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP bind address.
    pub http_addr: SocketAddr,

    /// TLS bind address.
    pub https_addr: SocketAddr,

    /// Control plane base URL (example: http://localhost:8080).
    pub control_plane_url: String,

    /// Optional bearer token for control-plane API access.
    pub control_plane_token: Option<RedactedString>,

    /// Poll interval for the control-plane list source.
    pub poll_interval: Duration,

    /// Interval at which the full current state is re-sent to consumers.
    pub resync_interval: Duration,

    /// Directory for request-body spool files.
    pub spool_dir: PathBuf,

    /// Fixed `host=ip:port` routes, bypassing the control plane (dev mode).
    pub static_routes: Vec<(String, String)>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let http_addr: SocketAddr = std::env::var("GANTRY_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:80".to_string())
            .parse()
            .context("GANTRY_HTTP_ADDR must be a socket address.")?;

        let https_addr: SocketAddr = std::env::var("GANTRY_HTTPS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:443".to_string())
            .parse()
            .context("GANTRY_HTTPS_ADDR must be a socket address.")?;

        let control_plane_url = std::env::var("GANTRY_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());

        let control_plane_token = std::env::var("GANTRY_API_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(RedactedString::new);

        let poll_interval_ms: u64 = std::env::var("GANTRY_POLL_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("GANTRY_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let resync_interval_ms: u64 = std::env::var("GANTRY_RESYNC_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("GANTRY_RESYNC_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(60_000);
        let resync_interval = Duration::from_millis(resync_interval_ms.max(1000));

        let spool_dir = std::env::var("GANTRY_SPOOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        let static_routes = match std::env::var("GANTRY_STATIC_ROUTES") {
            Ok(raw) => parse_static_routes(&raw)?,
            Err(_) => Vec::new(),
        };

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            http_addr,
            https_addr,
            control_plane_url,
            control_plane_token,
            poll_interval,
            resync_interval,
            spool_dir,
            static_routes,
            log_level,
        })
    }
}

/// Parse `host=ip:port` pairs separated by commas.
fn parse_static_routes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut routes = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, endpoint) = entry
            .split_once('=')
            .with_context(|| format!("static route {entry:?} is not host=ip:port"))?;
        routes.push((host.trim().to_string(), endpoint.trim().to_string()));
    }
    Ok(routes)
}
