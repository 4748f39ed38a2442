//! tetherd: Tether push gateway node.
//!
//! The session directory is an in-process `MemoryStore`, so presence is only
//! shared by nodes inside one process. Separate `tetherd` processes each see
//! their own directory; a shared backend plugs in through `DirectoryStore`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, oneshot};

use tether_api::{ApiState, HeaderAuthenticator, HttpRelayClient};
use tether_core::config::TetherConfig;
use tether_services::{MemoryStore, NodeContext};

mod sweep;

/// How long the HTTP server gets to finish in-flight requests after drain.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let listen_addr = config.node.listen_addr.clone();
    tracing::info!(
        identity = %config.node.identity(),
        listen = %listen_addr,
        max_hops = config.forward.max_hops,
        keepalive = config.keepalive.enabled,
        "tetherd starting"
    );

    // ── Node context ─────────────────────────────────────────────────────────
    let relay = HttpRelayClient::new(config.forward.relay_timeout())
        .context("failed to build relay client")?;
    let store = MemoryStore::new();
    tracing::info!("session directory: in-process memory store, not shared with other processes");
    let node = NodeContext::new(config.clone(), Arc::new(store), Arc::new(relay));
    let state = ApiState::new(node.clone(), Arc::new(HeaderAuthenticator));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut api_task = tokio::spawn(async move {
        let stop = async move {
            stop_rx.await.ok();
        };
        tether_api::serve(state, &listen_addr, stop).await
    });

    let _sweep_task = config.keepalive.enabled.then(|| {
        tokio::spawn(sweep::keepalive_loop(
            node.clone(),
            config.keepalive.sweep_interval(),
            shutdown_tx.subscribe(),
        ))
    });

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();

    let api_exited = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            false
        }
        r = &mut api_task => {
            tracing::error!("API server exited: {:?}", r);
            true
        }
    };

    // Offline before close, so reconnects elsewhere resume the same sessions.
    match node.drain().await {
        Ok(report) => tracing::info!(
            offlined = report.updated,
            missing = report.missing,
            "sessions handed off"
        ),
        Err(e) => tracing::warn!(error = %e, "drain could not offline every session"),
    }

    if !api_exited {
        let _ = stop_tx.send(());
        match tokio::time::timeout(SERVER_STOP_GRACE, api_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "API server stopped with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "API server task failed"),
            Err(_) => tracing::warn!("API server did not stop in time"),
        }
    }

    Ok(())
}
