//! redirector
//!
//! User-space half of a transparent proxy.
//!
//! This service:
//! - Accepts TCP connections that the kernel redirected to it
//! - Recovers each connection's true destination and outbound from the
//!   redirect table
//! - Selects a dialer from the outbound group and dials the destination
//! - Relays bytes both ways with half-close and linger teardown
//! - Reloads redirect entries from the snapshot file on SIGHUP

use std::sync::Arc;

use anyhow::Result;
use redirector_relay::config::Config;
use redirector_relay::snapshot::{Snapshot, SnapshotStore};
use redirector_relay::{ConnectionHandler, Listener, ListenerConfig, OutboundTable, StaticRedirectTable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to REDIRECTOR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting redirector");
    info!(
        listen_addr = %config.listen_addr,
        max_connections = config.max_connections,
        linger_timeout_ms = config.linger_timeout.as_millis() as u64,
        snapshot_file = ?config.snapshot_file,
        "Configuration loaded"
    );

    let store = config.snapshot_file.clone().map(SnapshotStore::new);
    let snapshot = match &store {
        Some(store) => store.load()?,
        None => Snapshot::default(),
    };

    let outbounds = Arc::new(OutboundTable::new(
        snapshot.build_outbounds(config.dial_timeout),
    ));
    let redirects = Arc::new(StaticRedirectTable::from_entries(snapshot.redirect_entries()));
    info!(
        outbounds = ?outbounds.names(),
        redirect_count = redirects.len(),
        "Tables ready"
    );

    if let Some(store) = store {
        spawn_redirect_reload(store, Arc::clone(&redirects));
    }

    let handler = Arc::new(
        ConnectionHandler::new(redirects, outbounds).with_linger(config.linger_timeout),
    );

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, handler).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    listener
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Reload redirect entries from the snapshot file on SIGHUP.
#[cfg(unix)]
fn spawn_redirect_reload(store: SnapshotStore, redirects: Arc<StaticRedirectTable>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, redirect reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = store.reload_redirects(&redirects) {
                warn!(error = %e, "Redirect reload failed, keeping current entries");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_redirect_reload(_store: SnapshotStore, _redirects: Arc<StaticRedirectTable>) {}
