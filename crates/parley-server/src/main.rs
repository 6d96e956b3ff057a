//! # parley-server
//!
//! Presence and real-time delivery server for Parley chat.
//!
//! This binary provides:
//! - **Connection registry** mapping each user to their live WebSocket
//!   connections (one or many, per `CONNECTION_POLICY`)
//! - **Presence** derived from client heartbeats, independent of sockets
//! - **Delivery router** that persists every message before pushing it to
//!   the receiver's live connections, pruning dead ones on the way
//! - **REST API** (axum) for sending messages, reading history, heartbeats
//!   and the presence list
//! - **JWT verification** against the identity provider's published keys

mod api;
mod config;
mod error;
mod identity;
mod lifecycle;
mod presence;
mod registry;
mod router;
mod socket;
mod transport;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_shared::constants::APP_NAME;
use parley_store::SqliteStore;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::identity::{HttpKeySet, JwksVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let jwks_url = config
        .jwks_url()
        .context("JWKS_URL or TOKEN_ISSUER must be set")?;

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Message log and user directory (creates the database if missing)
    let store = Arc::new(
        SqliteStore::open_at(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );

    // Identity provider keys, fetched lazily on the first credential
    let key_set = HttpKeySet::new(jwks_url.as_str(), config.verify_timeout)?;
    let verifier = Arc::new(
        JwksVerifier::new(Arc::new(key_set), config.jwks_min_refresh)
            .with_issuer(config.token_issuer.clone())
            .with_audience(config.token_audience.clone()),
    );
    info!(
        jwks = %jwks_url,
        policy = %config.connection_policy,
        "Identity provider configured"
    );

    let http_addr = config.http_addr;
    let retention = config.presence_retention;
    let app_state = AppState::new(config, verifier, store);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic presence cleanup (every 10 minutes)
    let presence = app_state.presence.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            presence.purge_idle(Utc::now(), retention);
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
