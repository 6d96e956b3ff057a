//! Server configuration loaded from environment variables.
//!
//! All settings except the identity provider location have sensible
//! defaults so the server can start with minimal configuration for local
//! development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_JWKS_MIN_REFRESH_SECS, DEFAULT_ONLINE_THRESHOLD_SECS,
    DEFAULT_PRESENCE_RETENTION_SECS, DEFAULT_PUSH_TIMEOUT_SECS, DEFAULT_SOCKET_BUFFER,
    DEFAULT_STORE_TIMEOUT_SECS, DEFAULT_VERIFY_TIMEOUT_SECS,
};

use crate::registry::ConnectionPolicy;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file holding messages and the user directory.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// URL of the identity provider's published JWK set.
    /// Env: `JWKS_URL`
    /// Default: derived from `TOKEN_ISSUER`.
    pub jwks_url: Option<String>,

    /// Expected `iss` claim.
    /// Env: `TOKEN_ISSUER`
    pub token_issuer: Option<String>,

    /// Expected `aud` claim. When unset the audience is not checked.
    /// Env: `TOKEN_AUDIENCE`
    pub token_audience: Option<String>,

    /// A user is online while their last heartbeat is younger than this.
    /// Env: `ONLINE_THRESHOLD_SECS`
    /// Default: 300
    pub online_threshold: Duration,

    /// Presence records idle longer than this are evicted.
    /// Env: `PRESENCE_RETENTION_SECS`
    /// Default: 3600
    pub presence_retention: Duration,

    /// Bound on connect-time credential verification.
    /// Env: `VERIFY_TIMEOUT_SECS`
    /// Default: 5
    pub verify_timeout: Duration,

    /// Bound on a single push to a live connection.
    /// Env: `PUSH_TIMEOUT_SECS`
    /// Default: 3
    pub push_timeout: Duration,

    /// Bound on appending one message to the store.
    /// Env: `STORE_TIMEOUT_SECS`
    /// Default: 5
    pub store_timeout: Duration,

    /// Minimum spacing between key set refreshes caused by unknown key ids.
    /// Env: `JWKS_MIN_REFRESH_SECS`
    /// Default: 30
    pub jwks_min_refresh: Duration,

    /// How many live connections a user may hold.
    /// Env: `CONNECTION_POLICY` (`multi` / `single`)
    /// Default: `multi`
    pub connection_policy: ConnectionPolicy,

    /// Outbound frames buffered per live connection.
    /// Env: `SOCKET_BUFFER`
    /// Default: 64
    pub socket_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            jwks_url: None,
            token_issuer: None,
            token_audience: None,
            online_threshold: Duration::from_secs(DEFAULT_ONLINE_THRESHOLD_SECS),
            presence_retention: Duration::from_secs(DEFAULT_PRESENCE_RETENTION_SECS),
            verify_timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
            push_timeout: Duration::from_secs(DEFAULT_PUSH_TIMEOUT_SECS),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            jwks_min_refresh: Duration::from_secs(DEFAULT_JWKS_MIN_REFRESH_SECS),
            connection_policy: ConnectionPolicy::Multi,
            socket_buffer: DEFAULT_SOCKET_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            config.http_addr = parse_or_keep("HTTP_ADDR", &addr, config.http_addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.jwks_url = lookup("JWKS_URL").filter(|v| !v.is_empty());
        config.token_issuer = lookup("TOKEN_ISSUER")
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string());
        config.token_audience = lookup("TOKEN_AUDIENCE").filter(|v| !v.is_empty());

        for (key, slot) in [
            ("ONLINE_THRESHOLD_SECS", &mut config.online_threshold),
            ("PRESENCE_RETENTION_SECS", &mut config.presence_retention),
            ("VERIFY_TIMEOUT_SECS", &mut config.verify_timeout),
            ("PUSH_TIMEOUT_SECS", &mut config.push_timeout),
            ("STORE_TIMEOUT_SECS", &mut config.store_timeout),
            ("JWKS_MIN_REFRESH_SECS", &mut config.jwks_min_refresh),
        ] {
            if let Some(value) = lookup(key) {
                let secs = parse_or_keep(key, &value, slot.as_secs());
                *slot = Duration::from_secs(secs);
            }
        }

        if let Some(value) = lookup("CONNECTION_POLICY") {
            config.connection_policy =
                parse_or_keep("CONNECTION_POLICY", &value, config.connection_policy);
        }

        if let Some(value) = lookup("SOCKET_BUFFER") {
            let buffer = parse_or_keep("SOCKET_BUFFER", &value, config.socket_buffer);
            config.socket_buffer = buffer.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Where to fetch the identity provider's key set from.
    ///
    /// An explicit `JWKS_URL` wins; otherwise the OpenID well-known path
    /// under the issuer is used.
    pub fn jwks_url(&self) -> Option<String> {
        self.jwks_url.clone().or_else(|| {
            self.token_issuer
                .as_ref()
                .map(|issuer| format!("{issuer}/.well-known/jwks.json"))
        })
    }
}

fn parse_or_keep<T>(key: &str, raw: &str, current: T) -> T
where
    T: FromStr,
{
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            current
        }
    }
}
