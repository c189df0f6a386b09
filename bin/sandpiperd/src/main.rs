//! Sandpiper control-plane backend.
//!
//! Wires the broker, the log fan-out, the app store and the three HTTP
//! surfaces (reverse proxy, public API, internal API) together, then runs
//! until a shutdown signal arrives.

mod config;
mod routes;
mod state;
mod store;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use sandpiper_broker::Broker;
use sandpiper_logmgr::LogFanout;
use sandpiper_proxy::{AppProxy, ProxyServer};

use crate::config::Config;
use crate::state::ServerState;
use crate::store::{AppStore, MemoryAppStore, StoreDirectory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(production = config.production, "Starting sandpiper backend");

    tokio::fs::create_dir_all(&config.log_dir)
        .await
        .context("create log directory")?;

    let broker = Broker::connect(&config.agent_endpoints, config.broker_config())
        .await
        .context("connect to agents")?;
    let logs = Arc::new(
        LogFanout::new(&config.log_dir, config.log_idle).context("initialize log storage")?,
    );
    let store: Arc<dyn AppStore> = Arc::new(MemoryAppStore::new());

    let state = ServerState {
        broker: broker.clone(),
        logs,
        store: store.clone(),
        config: config.clone(),
    };

    // Reverse proxy for app traffic.
    let directory = Arc::new(StoreDirectory::new(store));
    let proxy = AppProxy::new(broker.clone(), directory, config.proxy_config());
    let proxy_server = Arc::new(ProxyServer::new(proxy));
    let proxy_task = {
        let server = proxy_server.clone();
        let addr = config.proxy_addr;
        tokio::spawn(async move {
            if let Err(err) = server.run(addr).await {
                error!(error = %err, "Proxy server failed");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Public API.
    let api_listener = TcpListener::bind(config.api_addr)
        .await
        .context("bind API listener")?;
    info!(addr = %config.api_addr, "API server listening");
    let api_task = {
        let router = routes::api_router(state.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(api_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .ok();
        })
    };

    // Internal API, reachable from sandboxes only.
    let internal_listener = TcpListener::bind(config.internal_addr)
        .await
        .context("bind internal listener")?;
    info!(addr = %config.internal_addr, "Internal API server listening");
    let internal_task = {
        let router = routes::internal_router(state.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(internal_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .ok();
        })
    };

    shutdown_signal().await;
    info!("Shutting down");

    // Proxy first, then the API surfaces, then the broker.
    proxy_server.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;
    let _ = api_task.await;
    let _ = internal_task.await;
    broker.shutdown().await;

    info!("Servers shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
