//! Relay configuration.
//!
//! Everything is read from `REDIRECTOR_*` environment variables; outbound
//! groups and static redirects come from an optional snapshot file.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::{DEFAULT_LINGER_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Default address redirected traffic lands on.
pub const DEFAULT_LISTEN_ADDR: &str = "[::]:12345";

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept redirected connections on.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Read deadline armed after a half-close.
    pub linger_timeout: Duration,

    /// Optional connect timeout for direct dialers.
    pub dial_timeout: Option<Duration>,

    /// Snapshot file with outbound groups and static redirects.
    pub snapshot_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("REDIRECTOR_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("REDIRECTOR_LISTEN_ADDR must be a socket address (example: [::]:12345).")?;

        let max_connections = parse_var::<usize, _>(&lookup, "REDIRECTOR_MAX_CONNECTIONS")
            .context("REDIRECTOR_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let linger_timeout = parse_var::<u64, _>(&lookup, "REDIRECTOR_LINGER_TIMEOUT_MS")
            .context("REDIRECTOR_LINGER_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(DEFAULT_LINGER_TIMEOUT);

        let dial_timeout = parse_var::<u64, _>(&lookup, "REDIRECTOR_DIAL_TIMEOUT_MS")
            .context("REDIRECTOR_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        let snapshot_file = lookup("REDIRECTOR_SNAPSHOT_FILE").map(PathBuf::from);

        let log_level = lookup("REDIRECTOR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            max_connections,
            linger_timeout,
            dial_timeout,
            snapshot_file,
            log_level,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {}", name))
}
